use super::request::OpCode;
use crate::{KeeperState, Stat, WatchedEvent, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt};
use failure::bail;
use std::io::{self, Read};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    Connect {
        protocol_version: i32,
        timeout: i32,
        session_id: i64,
        password: Vec<u8>,
        read_only: bool,
    },
    Stat(Stat),
    GetData {
        bytes: Vec<u8>,
        stat: Stat,
    },
    Empty,
    Strings(Vec<String>),
    String(String),
}

pub(crate) trait ReadFrom: Sized {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Self>;
}

impl ReadFrom for Stat {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Stat> {
        Ok(Stat {
            czxid: read.read_i64::<BigEndian>()?,
            mzxid: read.read_i64::<BigEndian>()?,
            ctime: read.read_i64::<BigEndian>()?,
            mtime: read.read_i64::<BigEndian>()?,
            version: read.read_i32::<BigEndian>()?,
            cversion: read.read_i32::<BigEndian>()?,
            aversion: read.read_i32::<BigEndian>()?,
            ephemeral_owner: read.read_i64::<BigEndian>()?,
            data_length: read.read_i32::<BigEndian>()?,
            num_children: read.read_i32::<BigEndian>()?,
            pzxid: read.read_i64::<BigEndian>()?,
        })
    }
}

impl ReadFrom for WatchedEvent {
    fn read_from<R: Read>(read: &mut R) -> io::Result<WatchedEvent> {
        let wtype = read.read_i32::<BigEndian>()?;
        let state = read.read_i32::<BigEndian>()?;
        let path = read.read_string()?;
        let event_type = WatchedEventType::from_code(wtype).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown event type {}", wtype),
            )
        })?;
        let keeper_state = KeeperState::from_code(state).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown keeper state {}", state),
            )
        })?;
        Ok(WatchedEvent {
            event_type,
            keeper_state,
            path,
        })
    }
}

pub(crate) trait BufferReader: Read {
    fn read_buffer(&mut self) -> io::Result<Vec<u8>>;
}

impl<R: Read> BufferReader for R {
    fn read_buffer(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_i32::<BigEndian>()?;
        let len = if len < 0 { 0 } else { len as usize };
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

pub(crate) trait StringReader: Read {
    fn read_string(&mut self) -> io::Result<String>;
}

impl<R: Read> StringReader for R {
    fn read_string(&mut self) -> io::Result<String> {
        let raw = self.read_buffer()?;
        String::from_utf8(raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Response {
    pub(super) fn parse(opcode: OpCode, mut reader: &[u8]) -> Result<Self, failure::Error> {
        match opcode {
            OpCode::CreateSession => Ok(Response::Connect {
                protocol_version: reader.read_i32::<BigEndian>()?,
                timeout: reader.read_i32::<BigEndian>()?,
                session_id: reader.read_i64::<BigEndian>()?,
                password: reader.read_buffer()?,
                // older servers do not send the read-only flag at all
                read_only: reader.read_u8().map(|b| b != 0).unwrap_or(false),
            }),
            OpCode::Exists | OpCode::SetData => Ok(Response::Stat(Stat::read_from(&mut reader)?)),
            OpCode::GetData => Ok(Response::GetData {
                bytes: reader.read_buffer()?,
                stat: Stat::read_from(&mut reader)?,
            }),
            OpCode::Delete => Ok(Response::Empty),
            OpCode::Create => Ok(Response::String(reader.read_string()?)),
            OpCode::GetChildren => {
                let n = reader.read_i32::<BigEndian>()?;
                let mut children = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    children.push(reader.read_string()?);
                }
                Ok(Response::Strings(children))
            }
            _ => bail!("no response parser for {:?}", opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn write_stat(buf: &mut Vec<u8>, version: i32) {
        for v in &[1i64, 2, 3, 4] {
            buf.write_i64::<BigEndian>(*v).unwrap();
        }
        buf.write_i32::<BigEndian>(version).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();
        buf.write_i64::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(2).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();
        buf.write_i64::<BigEndian>(5).unwrap();
    }

    #[test]
    fn parses_get_data() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(2).unwrap();
        buf.extend_from_slice(b"hi");
        write_stat(&mut buf, 7);

        match Response::parse(OpCode::GetData, &buf).unwrap() {
            Response::GetData { bytes, stat } => {
                assert_eq!(b"hi".to_vec(), bytes);
                assert_eq!(7, stat.version);
                assert_eq!(2, stat.mzxid);
                assert_eq!(5, stat.pzxid);
            }
            r => panic!("unexpected response {:?}", r),
        }
    }

    #[test]
    fn parses_children() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(2).unwrap();
        for name in &["a", "bc"] {
            buf.write_i32::<BigEndian>(name.len() as i32).unwrap();
            buf.extend_from_slice(name.as_bytes());
        }
        assert_eq!(
            Response::Strings(vec!["a".to_string(), "bc".to_string()]),
            Response::parse(OpCode::GetChildren, &buf).unwrap()
        );
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(10).unwrap();
        buf.extend_from_slice(b"short");
        assert!(Response::parse(OpCode::Create, &buf).is_err());
    }

    #[test]
    fn parses_watch_events() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(3).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        buf.write_i32::<BigEndian>(2).unwrap();
        buf.extend_from_slice(b"/x");
        let e = WatchedEvent::read_from(&mut &buf[..]).unwrap();
        assert_eq!(WatchedEvent::node(WatchedEventType::NodeDataChanged, "/x"), e);
    }
}
