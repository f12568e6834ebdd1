use log::trace;

use super::block::{self, BLOCK_SENTINEL};
use super::command::{Arg, Command};
use crate::error::VnaError;
use crate::types::{Reply, ReplyShape, ScpiValue, ValueType};

// Mnemonics the session itself issues
pub const ERROR_QUERY: &str = "SYST:ERR?";
pub const OPC_QUERY: &str = "*OPC?";
pub const CLEAR_STATUS: &str = "*CLS";
pub const FILE_TRANSFER: &str = "MMEM:TRAN";
pub const FILE_TRANSFER_QUERY: &str = "MMEM:TRAN?";

/// Pure SCPI text encoding and reply decoding. Never touches the transport.
#[derive(Debug, Clone)]
pub struct ScpiCodec {
    delimiter: Vec<u8>,
}

impl ScpiCodec {
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Encode a command followed by the line delimiter
    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, VnaError> {
        let mut bytes = self.encode_unterminated(command)?.into_bytes();
        bytes.extend_from_slice(&self.delimiter);
        Ok(bytes)
    }

    /// Mnemonic and arguments without a terminator, for messages that carry a
    /// trailing block
    pub fn encode_unterminated(&self, command: &Command) -> Result<String, VnaError> {
        let mnemonic = command.mnemonic().trim();
        if mnemonic.is_empty() {
            return Err(VnaError::InvalidCommand("empty mnemonic".to_string()));
        }
        self.reject_delimiter(mnemonic)?;

        if command.args().is_empty() {
            return Ok(mnemonic.to_string());
        }

        let args = command
            .args()
            .iter()
            .map(|arg| {
                let text = format_arg(arg)?;
                self.reject_delimiter(&text)?;
                Ok(text)
            })
            .collect::<Result<Vec<_>, VnaError>>()?;

        Ok(format!("{} {}", mnemonic, args.join(",")))
    }

    fn reject_delimiter(&self, text: &str) -> Result<(), VnaError> {
        let bytes = text.as_bytes();
        let contains = !self.delimiter.is_empty()
            && bytes.windows(self.delimiter.len()).any(|w| w == self.delimiter.as_slice());
        if contains {
            Err(VnaError::InvalidCommand(format!(
                "{text:?} contains the line delimiter"
            )))
        } else {
            Ok(())
        }
    }

    /// Decode raw reply bytes (terminator optional) into the declared shape.
    ///
    /// Replies starting with `#` are definite-length blocks and are handed to
    /// the block decoder.
    pub fn decode(&self, raw: &[u8], shape: ReplyShape) -> Result<Reply, VnaError> {
        if raw.first() == Some(&BLOCK_SENTINEL) {
            let payload = block::decode_block(raw)?;
            return match shape {
                ReplyShape::Block => Ok(Reply::Block(payload)),
                other => Err(VnaError::malformed(
                    format!("<block of {} bytes>", payload.len()),
                    format!("expected {other:?} reply"),
                )),
            };
        }

        let text = std::str::from_utf8(raw)
            .map_err(|_| VnaError::malformed(String::from_utf8_lossy(raw), "reply is not valid UTF-8"))?;
        let text = self.strip_terminator(text).trim();
        trace!("Decoding {:?} as {:?}", text, shape);

        match shape {
            ReplyShape::Raw => Ok(Reply::Scalar(ScpiValue::String(text.to_string()))),
            ReplyShape::Scalar(value_type) => {
                let fields = split_fields(text)?;
                match fields.as_slice() {
                    [field] => Ok(Reply::Scalar(parse_field(field, value_type, text)?)),
                    _ => Err(VnaError::malformed(
                        text,
                        format!("expected one field, got {}", fields.len()),
                    )),
                }
            }
            ReplyShape::List(value_type) => {
                if text.is_empty() {
                    return Ok(Reply::List(Vec::new()));
                }
                split_fields(text)?
                    .iter()
                    .map(|field| parse_field(field, value_type, text))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Reply::List)
            }
            ReplyShape::Catalog => {
                let inner = unquote(text).unwrap_or_else(|| text.to_string());
                let names = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| ScpiValue::String(name.to_string()))
                    .collect();
                Ok(Reply::List(names))
            }
            ReplyShape::Block => Err(VnaError::malformed(text, "expected a '#' block reply")),
        }
    }

    fn strip_terminator<'a>(&self, text: &'a str) -> &'a str {
        std::str::from_utf8(&self.delimiter)
            .ok()
            .and_then(|d| text.strip_suffix(d))
            .unwrap_or(text)
    }
}

fn format_arg(arg: &Arg) -> Result<String, VnaError> {
    Ok(match arg {
        Arg::Int(v) => v.to_string(),
        Arg::Float(v) => format_float(*v),
        Arg::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
        Arg::Str(s) => quote(s),
        Arg::Token(t) => {
            let mut chars = t.chars();
            let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(VnaError::InvalidCommand(format!(
                    "{t:?} is not a valid enumerated token"
                )));
            }
            t.clone()
        }
    })
}

/// Canonical numeric form: plain decimal for moderate magnitudes, otherwise
/// scientific notation. Non-finite values use the SCPI keywords.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return (if value > 0.0 { "INF" } else { "NINF" }).to_string();
    }
    let magnitude = value.abs();
    if magnitude == 0.0 {
        "0".to_string()
    } else if (1e-4..1e7).contains(&magnitude) {
        format!("{value}")
    } else {
        format!("{value:E}")
    }
}

/// Double-quote a string, doubling embedded quotes
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Strip matching surrounding quotes and undouble embedded ones
fn unquote(field: &str) -> Option<String> {
    let q = field.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = field.strip_prefix(q)?.strip_suffix(q)?;
    let doubled = format!("{q}{q}");
    Some(inner.replace(&doubled, &q.to_string()))
}

/// Split on commas outside quoted strings, trimming each field
fn split_fields(text: &str) -> Result<Vec<&str>, VnaError> {
    let mut fields = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                fields.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(VnaError::malformed(text, "unterminated quoted string"));
    }
    fields.push(text[start..].trim());
    Ok(fields)
}

fn parse_field(field: &str, value_type: ValueType, reply: &str) -> Result<ScpiValue, VnaError> {
    let bad = || VnaError::malformed(reply, format!("{field:?} is not a valid {value_type:?}"));
    // One leading '+' is allowed, never followed by another sign
    let unsigned = match field.strip_prefix('+') {
        Some(rest) if rest.starts_with(|c| c == '+' || c == '-') => return Err(bad()),
        Some(rest) => rest,
        None => field,
    };
    match value_type {
        ValueType::Integer => unsigned.parse::<i64>().map(ScpiValue::Int).map_err(|_| bad()),
        ValueType::Float => match unsigned.to_ascii_uppercase().as_str() {
            "NAN" => Ok(ScpiValue::Float(f64::NAN)),
            "INF" => Ok(ScpiValue::Float(f64::INFINITY)),
            "NINF" | "-INF" => Ok(ScpiValue::Float(f64::NEG_INFINITY)),
            // Rust also accepts "inf"/"infinity", which are not SCPI numbers
            upper if upper.contains("INF") => Err(bad()),
            _ => unsigned.parse::<f64>().map(ScpiValue::Float).map_err(|_| bad()),
        },
        ValueType::Boolean => match unsigned.to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(ScpiValue::Bool(true)),
            "0" | "OFF" => Ok(ScpiValue::Bool(false)),
            _ => Err(bad()),
        },
        ValueType::String => Ok(ScpiValue::String(
            unquote(field).unwrap_or_else(|| field.to_string()),
        )),
    }
}

/// Parse one `SYST:ERR?` reply into `(code, message)`
pub fn parse_error_reply(text: &str) -> Result<(i32, String), VnaError> {
    let text = text.trim();
    let (code, message) = text
        .split_once(',')
        .ok_or_else(|| VnaError::malformed(text, "expected <code>,\"<message>\""))?;
    // `parse` takes a single optional sign, so "+-5" is rejected
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| VnaError::malformed(text, "error code is not an integer"))?;
    let message = message.trim();
    Ok((code, unquote(message).unwrap_or_else(|| message.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ScpiCodec {
        ScpiCodec::new(b"\n".to_vec())
    }

    #[test]
    fn test_encode_arguments() {
        let cmd = Command::action("SENS1:CORR:CSET:ACT")
            .string("cal \"A\"")
            .boolean(true)
            .build();
        assert_eq!(
            codec().encode(&cmd).unwrap(),
            b"SENS1:CORR:CSET:ACT \"cal \"\"A\"\"\",1\n"
        );

        let cmd = Command::action("FORM").token("REAL").int(64).build();
        assert_eq!(codec().encode(&cmd).unwrap(), b"FORM REAL,64\n");

        let cmd = Command::query("*IDN?", ReplyShape::Raw).build();
        assert_eq!(codec().encode(&cmd).unwrap(), b"*IDN?\n");
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(-15.0), "-15");
        assert_eq!(format_float(0.25), "0.25");
        assert_eq!(format_float(1e9), "1E9");
        assert_eq!(format_float(44e9), "4.4E10");
        assert_eq!(format_float(1.5e-6), "1.5E-6");
        assert_eq!(format_float(f64::NAN), "NAN");
        assert_eq!(format_float(f64::NEG_INFINITY), "NINF");
    }

    #[test]
    fn test_encode_rejects_delimiter() {
        let cmd = Command::action("MMEM:STOR").string("a\nb").build();
        assert!(matches!(codec().encode(&cmd), Err(VnaError::InvalidCommand(_))));

        let crlf = ScpiCodec::new(b"\r\n".to_vec());
        let cmd = Command::action("DISP:TITL").string("line\nbreak").build();
        assert!(crlf.encode(&cmd).is_ok());

        let cmd = Command::action("SENS1:SWE:MODE").token("1nvalid").build();
        assert!(matches!(codec().encode(&cmd), Err(VnaError::InvalidCommand(_))));
    }

    #[test]
    fn test_decode_scalars() {
        let c = codec();
        let int = c.decode(b"+201\n", ReplyShape::Scalar(ValueType::Integer)).unwrap();
        assert_eq!(int.as_i64().unwrap(), 201);

        let float = c.decode(b"+1.00000000000E+009", ReplyShape::Scalar(ValueType::Float)).unwrap();
        assert_eq!(float.as_f64().unwrap(), 1e9);

        let flag = c.decode(b"ON", ReplyShape::Scalar(ValueType::Boolean)).unwrap();
        assert!(flag.as_bool().unwrap());

        let name = c.decode(b"\"CH1_S11_1\"", ReplyShape::Scalar(ValueType::String)).unwrap();
        assert_eq!(name.as_str().unwrap(), "CH1_S11_1");
    }

    #[test]
    fn test_decode_malformed() {
        let c = codec();
        assert!(matches!(
            c.decode(b"12abc", ReplyShape::Scalar(ValueType::Integer)),
            Err(VnaError::MalformedReply { .. })
        ));
        assert!(matches!(
            c.decode(b"1,2", ReplyShape::Scalar(ValueType::Integer)),
            Err(VnaError::MalformedReply { .. })
        ));
        assert!(matches!(
            c.decode(b"infinity", ReplyShape::Scalar(ValueType::Float)),
            Err(VnaError::MalformedReply { .. })
        ));
        assert!(matches!(
            c.decode(b"\"open", ReplyShape::List(ValueType::String)),
            Err(VnaError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_only_one_sign_accepted() {
        let c = codec();
        for (raw, value_type) in [
            (&b"+-5"[..], ValueType::Integer),
            (b"++5", ValueType::Integer),
            (b"-+5", ValueType::Integer),
            (b"+-5.0E+003", ValueType::Float),
            (b"+-INF", ValueType::Float),
            (b"+-1", ValueType::Boolean),
        ] {
            assert!(
                matches!(
                    c.decode(raw, ReplyShape::Scalar(value_type)),
                    Err(VnaError::MalformedReply { .. })
                ),
                "{:?} accepted",
                String::from_utf8_lossy(raw)
            );
        }
        assert_eq!(
            c.decode(b"-5", ReplyShape::Scalar(ValueType::Integer)).unwrap().as_i64().unwrap(),
            -5
        );
        assert!(parse_error_reply("+-113,\"Undefined header\"").is_err());
    }

    #[test]
    fn test_decode_lists_and_catalogs() {
        let c = codec();
        let list = c
            .decode(b"+1.5E+009, -2.0 ,9.91E37\n", ReplyShape::List(ValueType::Float))
            .unwrap();
        assert_eq!(list.as_f64_list().unwrap(), vec![1.5e9, -2.0, 9.91e37]);

        let quoted = c
            .decode(b"\"a,b\",\"c\"", ReplyShape::List(ValueType::String))
            .unwrap();
        assert_eq!(quoted.as_strings().unwrap(), vec!["a,b", "c"]);

        let catalog = c.decode(b"\"CH1_S11,S11,CH1_S21,S21\"\n", ReplyShape::Catalog).unwrap();
        assert_eq!(
            catalog.as_strings().unwrap(),
            vec!["CH1_S11", "S11", "CH1_S21", "S21"]
        );

        let empty = c.decode(b"\"\"", ReplyShape::Catalog).unwrap();
        assert!(empty.as_strings().unwrap().is_empty());
    }

    #[test]
    fn test_decode_block_delegation() {
        let c = codec();
        let reply = c.decode(b"#15a\nb,c\n", ReplyShape::Block).unwrap();
        assert_eq!(reply.into_block().unwrap(), b"a\nb,c");
        assert!(c.decode(b"#15a\nb,c\n", ReplyShape::Scalar(ValueType::String)).is_err());
        assert!(c.decode(b"1,2", ReplyShape::Block).is_err());
    }

    #[test]
    fn test_parse_error_reply() {
        assert_eq!(
            parse_error_reply("-113,\"Undefined header\"").unwrap(),
            (-113, "Undefined header".to_string())
        );
        assert_eq!(
            parse_error_reply("+0,\"No error\"\n").unwrap(),
            (0, "No error".to_string())
        );
        assert_eq!(
            parse_error_reply("-222,\"Data out of range; value clipped, max 20\"").unwrap().1,
            "Data out of range; value clipped, max 20"
        );
        assert!(parse_error_reply("garbage").is_err());
    }
}
