//! Edge-case checks at the protocol's documented limits: token size, the
//! argument-count ceiling, and the zero-length argument case.

use remctld::message::{encode_argv, parse_argv, MAX_COMMAND_ARGS};
use remctld::token::{read_token, write_token, Token, TokenFlags, MAX_TOKEN_LENGTH};
use std::io::Cursor;

#[test]
fn token_payload_at_exactly_the_cap_is_accepted() {
    let payload = vec![0u8; MAX_TOKEN_LENGTH as usize];
    let mut buf = Vec::new();
    write_token(&mut buf, &Token::new(TokenFlags::DATA, payload.clone())).unwrap();

    let mut cursor = Cursor::new(buf);
    let token = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap();
    assert_eq!(token.payload, payload);
}

#[test]
fn token_payload_one_byte_over_the_cap_is_rejected() {
    // Hand-build the frame rather than going through write_token, since
    // write_token has no cap of its own to bypass.
    let mut buf = Vec::new();
    buf.push(TokenFlags::DATA.bits());
    buf.extend_from_slice(&(MAX_TOKEN_LENGTH + 1).to_be_bytes());
    buf.extend_from_slice(&vec![0u8; (MAX_TOKEN_LENGTH + 1) as usize]);

    let mut cursor = Cursor::new(buf);
    let err = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap_err();
    assert_eq!(err.exit_code(), remctld::ErrorCode::TooMuchData as i32);
}

#[test]
fn command_with_max_args_is_accepted() {
    let argv: Vec<Vec<u8>> = (0..MAX_COMMAND_ARGS).map(|i| i.to_string().into_bytes()).collect();
    let encoded = encode_argv(&argv);
    let decoded = parse_argv(&encoded).unwrap();
    assert_eq!(decoded.len(), MAX_COMMAND_ARGS);
}

#[test]
fn command_with_one_more_than_max_args_is_rejected() {
    let argv: Vec<Vec<u8>> = (0..=MAX_COMMAND_ARGS).map(|i| i.to_string().into_bytes()).collect();
    let encoded = encode_argv(&argv);
    let err = parse_argv(&encoded).unwrap_err();
    assert_eq!(err.exit_code(), remctld::ErrorCode::TooManyArgs as i32);
}

#[test]
fn zero_length_argument_round_trips() {
    let argv = vec![b"test".to_vec(), Vec::new(), b"trailing".to_vec()];
    let encoded = encode_argv(&argv);
    let decoded = parse_argv(&encoded).unwrap();
    assert_eq!(decoded, argv);
}
