pub(crate) mod conn;
mod date;
mod decode;
mod encode;
mod io;
mod parse;

pub(crate) use self::decode::{Decoded, Decoder};
pub(crate) use self::encode::{can_have_body, Encoder};
pub(crate) use self::io::Buffered;
pub(crate) use self::parse::{connection_has, parse_request, ParseConfig, RequestHead};
