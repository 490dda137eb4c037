//! Fluentd Forward protocol encoding.
//!
//! Records are sent in Message mode: `[tag, time, record]`, with an optional
//! fourth `option` map carrying the `chunk` id when acknowledgements are
//! requested.
//!
//! ```text
//! time = int32 seconds
//!      | ext(0) { u32 seconds (BE), u32 nanoseconds (BE) }   // EventTime
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use thiserror::Error;

/// MessagePack extension type used by Fluentd for EventTime.
pub const EVENT_TIME_EXT: i8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    MsgPack,
    Json,
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("MessagePack error: {0}")]
    MsgPack(#[from] rmp::encode::ValueWriteError<std::io::Error>),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),
    #[error("{0} is too large to encode")]
    TooLarge(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Encoder {
    pub format: Format,
    pub sub_second_precision: bool,
}

impl Encoder {
    pub fn new(format: Format, sub_second_precision: bool) -> Self {
        Self {
            format,
            sub_second_precision,
        }
    }

    pub fn encode(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        fields: &BTreeMap<String, String>,
    ) -> Result<Bytes, EncodingError> {
        self.encode_with_chunk(tag, time, fields, None)
    }

    pub fn encode_with_chunk(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        fields: &BTreeMap<String, String>,
        chunk: Option<&str>,
    ) -> Result<Bytes, EncodingError> {
        match self.format {
            Format::MsgPack => self.encode_msgpack(tag, time, fields, chunk),
            Format::Json => encode_json(tag, time, fields, chunk),
        }
    }

    fn encode_msgpack(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        fields: &BTreeMap<String, String>,
        chunk: Option<&str>,
    ) -> Result<Bytes, EncodingError> {
        let mut buf = Vec::with_capacity(64 + fields.values().map(String::len).sum::<usize>());

        let array_len = if chunk.is_some() { 4 } else { 3 };
        rmp::encode::write_array_len(&mut buf, array_len)?;
        write_str(&mut buf, tag)?;

        if self.sub_second_precision {
            let seconds = u32::try_from(time.timestamp())
                .map_err(|_| EncodingError::TimestampOutOfRange(time.timestamp()))?;
            rmp::encode::write_ext_meta(&mut buf, 8, EVENT_TIME_EXT)?;
            buf.write_all(&seconds.to_be_bytes())?;
            buf.write_all(&time.timestamp_subsec_nanos().to_be_bytes())?;
        } else {
            rmp::encode::write_sint(&mut buf, i64::from(unix_seconds(time)?))?;
        }

        let map_len = u32::try_from(fields.len()).map_err(|_| EncodingError::TooLarge("record"))?;
        rmp::encode::write_map_len(&mut buf, map_len)?;
        for (key, value) in fields {
            write_str(&mut buf, key)?;
            write_str(&mut buf, value)?;
        }

        if let Some(chunk) = chunk {
            rmp::encode::write_map_len(&mut buf, 1)?;
            write_str(&mut buf, "chunk")?;
            write_str(&mut buf, chunk)?;
        }

        Ok(Bytes::from(buf))
    }
}

fn unix_seconds(time: DateTime<Utc>) -> Result<i32, EncodingError> {
    let seconds = time.timestamp();
    i32::try_from(seconds).map_err(|_| EncodingError::TimestampOutOfRange(seconds))
}

fn write_str(buf: &mut Vec<u8>, value: &str) -> Result<(), EncodingError> {
    if u32::try_from(value.len()).is_err() {
        return Err(EncodingError::TooLarge("string"));
    }
    rmp::encode::write_str(buf, value)?;
    Ok(())
}

fn encode_json(
    tag: &str,
    time: DateTime<Utc>,
    fields: &BTreeMap<String, String>,
    chunk: Option<&str>,
) -> Result<Bytes, EncodingError> {
    let seconds = unix_seconds(time)?;
    let bytes = match chunk {
        Some(chunk) => {
            let option = BTreeMap::from([("chunk", chunk)]);
            serde_json::to_vec(&(tag, seconds, fields, option))?
        }
        None => serde_json::to_vec(&(tag, seconds, fields))?,
    };
    Ok(Bytes::from(bytes))
}

/// A decoded Message-mode entry.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Decoded {
    pub tag: String,
    pub seconds: i64,
    pub nanos: u32,
    pub fields: BTreeMap<String, String>,
    pub chunk: Option<String>,
}

#[cfg(test)]
pub(crate) fn decode(bytes: &[u8]) -> Result<Decoded, String> {
    use std::io::Read;

    fn err(e: impl std::fmt::Display) -> String {
        e.to_string()
    }

    fn read_str(rd: &mut &[u8]) -> Result<String, String> {
        let (value, rest) = rmp::decode::read_str_from_slice(*rd).map_err(err)?;
        let value = value.to_string();
        *rd = rest;
        Ok(value)
    }

    let mut rd = bytes;
    let len = rmp::decode::read_array_len(&mut rd).map_err(err)?;
    if !(3..=4).contains(&len) {
        return Err(format!("unexpected array length {len}"));
    }
    let tag = read_str(&mut rd)?;

    let (seconds, nanos) = match rd.first() {
        // fixext 8
        Some(0xd7) => {
            let meta = rmp::decode::read_ext_meta(&mut rd).map_err(err)?;
            if meta.typeid != EVENT_TIME_EXT || meta.size != 8 {
                return Err(format!("unexpected ext {meta:?}"));
            }
            let mut data = [0u8; 8];
            rd.read_exact(&mut data).map_err(err)?;
            let seconds = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let nanos = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            (i64::from(seconds), nanos)
        }
        _ => (rmp::decode::read_int::<i64, _>(&mut rd).map_err(err)?, 0),
    };

    let mut fields = BTreeMap::new();
    for _ in 0..rmp::decode::read_map_len(&mut rd).map_err(err)? {
        let key = read_str(&mut rd)?;
        let value = read_str(&mut rd)?;
        fields.insert(key, value);
    }

    let mut chunk = None;
    if len == 4 {
        for _ in 0..rmp::decode::read_map_len(&mut rd).map_err(err)? {
            let key = read_str(&mut rd)?;
            let value = read_str(&mut rd)?;
            if key == "chunk" {
                chunk = Some(value);
            }
        }
    }

    if !rd.is_empty() {
        return Err(format!("{} trailing bytes", rd.len()));
    }

    Ok(Decoded {
        tag,
        seconds,
        nanos,
        fields,
        chunk,
    })
}
