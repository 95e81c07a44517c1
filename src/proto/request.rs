use super::{Watch, WatchType};
use crate::{Acl, CreateMode, WatchedEvent};
use byteorder::{BigEndian, WriteBytesExt};
use futures::channel::oneshot;
use std::borrow::Cow;
use std::io::{self, Write};
use std::mem;

#[derive(Debug)]
pub(crate) enum Request {
    Connect {
        protocol_version: i32,
        last_zxid_seen: i64,
        timeout: i32,
        session_id: i64,
        passwd: Vec<u8>,
        read_only: bool,
    },
    Exists {
        path: String,
        watch: Watch,
    },
    Delete {
        path: String,
        version: i32,
    },
    SetData {
        path: String,
        data: Cow<'static, [u8]>,
        version: i32,
    },
    Create {
        path: String,
        data: Cow<'static, [u8]>,
        acl: Cow<'static, [Acl]>,
        mode: CreateMode,
    },
    GetChildren {
        path: String,
        watch: Watch,
    },
    GetData {
        path: String,
        watch: Watch,
    },
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(i32)]
#[allow(dead_code)]
pub(crate) enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetACL = 6,
    SetACL = 7,
    GetChildren = 8,
    Synchronize = 9,
    Ping = 11,
    GetChildren2 = 12,
    Check = 13,
    Multi = 14,
    Auth = 100,
    SetWatches = 101,
    Sasl = 102,
    CreateSession = -10,
    CloseSession = -11,
    Error = -1,
}

pub(crate) trait WriteTo {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()>;
}

impl WriteTo for Acl {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.perms.code())?;
        self.scheme.write_to(&mut writer)?;
        self.id.write_to(writer)
    }
}

impl WriteTo for u8 {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(*self)?;
        Ok(())
    }
}

impl WriteTo for str {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self.as_ref())
    }
}

impl WriteTo for [u8] {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self.as_ref())
    }
}

fn write_list<W, T>(mut writer: W, ts: &[T]) -> io::Result<()>
where
    T: WriteTo,
    W: Write,
{
    writer.write_i32::<BigEndian>(ts.len() as i32)?;
    for elem in ts {
        elem.write_to(&mut writer)?;
    }
    Ok(())
}

impl Request {
    pub(super) fn serialize_into(&self, buffer: &mut Vec<u8>) -> Result<(), io::Error> {
        match *self {
            Request::Connect {
                protocol_version,
                last_zxid_seen,
                timeout,
                session_id,
                ref passwd,
                read_only,
            } => {
                buffer.write_i32::<BigEndian>(protocol_version)?;
                buffer.write_i64::<BigEndian>(last_zxid_seen)?;
                buffer.write_i32::<BigEndian>(timeout)?;
                buffer.write_i64::<BigEndian>(session_id)?;
                passwd[..].write_to(&mut *buffer)?;
                buffer.write_u8(read_only as u8)?;
            }
            Request::GetData {
                ref path,
                ref watch,
            }
            | Request::GetChildren {
                ref path,
                ref watch,
            }
            | Request::Exists {
                ref path,
                ref watch,
            } => {
                path.write_to(&mut *buffer)?;
                buffer.write_u8(watch.to_u8())?;
            }
            Request::Delete { ref path, version } => {
                path.write_to(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(version)?;
            }
            Request::SetData {
                ref path,
                ref data,
                version,
            } => {
                path.write_to(&mut *buffer)?;
                data.write_to(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(version)?;
            }
            Request::Create {
                ref path,
                ref data,
                mode,
                ref acl,
            } => {
                path.write_to(&mut *buffer)?;
                data.write_to(&mut *buffer)?;
                write_list(&mut *buffer, acl)?;
                buffer.write_i32::<BigEndian>(mode as i32)?;
            }
        }
        Ok(())
    }

    pub(crate) fn opcode(&self) -> OpCode {
        match *self {
            Request::Connect { .. } => OpCode::CreateSession,
            Request::Exists { .. } => OpCode::Exists,
            Request::Delete { .. } => OpCode::Delete,
            Request::Create { .. } => OpCode::Create,
            Request::GetChildren { .. } => OpCode::GetChildren,
            Request::SetData { .. } => OpCode::SetData,
            Request::GetData { .. } => OpCode::GetData,
        }
    }

    /// The path this request is about, if any.
    pub(crate) fn path(&self) -> Option<&str> {
        match *self {
            Request::Connect { .. } => None,
            Request::Exists { ref path, .. }
            | Request::Delete { ref path, .. }
            | Request::SetData { ref path, .. }
            | Request::Create { ref path, .. }
            | Request::GetChildren { ref path, .. }
            | Request::GetData { ref path, .. } => Some(path),
        }
    }

    /// Detaches a caller-supplied watcher, leaving the watch flag set on the request.
    pub(crate) fn take_custom_watch(
        &mut self,
    ) -> Option<(String, oneshot::Sender<WatchedEvent>, WatchType)> {
        let (path, watch, wtype) = match self {
            Request::GetData { path, watch } => (path, watch, WatchType::Data),
            Request::GetChildren { path, watch } => (path, watch, WatchType::Child),
            Request::Exists { path, watch } => (path, watch, WatchType::Exist),
            _ => return None,
        };
        if let Watch::Custom(_) = *watch {
            // set to Global so that watch will be sent as 1u8
            if let Watch::Custom(w) = mem::replace(watch, Watch::Global) {
                return Some((path.clone(), w, wtype));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_length_prefixed() {
        let req = Request::Create {
            path: "/a".to_string(),
            data: Cow::Borrowed(&b"xy"[..]),
            acl: Cow::Borrowed(Acl::open_unsafe()),
            mode: CreateMode::EphemeralSequential,
        };
        let mut buf = Vec::new();
        req.serialize_into(&mut buf).unwrap();

        let mut expected = vec![0, 0, 0, 2, b'/', b'a', 0, 0, 0, 2, b'x', b'y', 0, 0, 0, 1];
        expected.extend_from_slice(&[0, 0, 0, 0b11111]);
        expected.extend_from_slice(&[0, 0, 0, 5]);
        expected.extend_from_slice(b"world");
        expected.extend_from_slice(&[0, 0, 0, 6]);
        expected.extend_from_slice(b"anyone");
        expected.extend_from_slice(&[0, 0, 0, 3]);
        assert_eq!(expected, buf);
        assert_eq!(OpCode::Create, req.opcode());
        assert_eq!(Some("/a"), req.path());
    }

    #[test]
    fn watch_flag_is_a_single_byte() {
        let req = Request::GetData {
            path: "/w".to_string(),
            watch: Watch::Global,
        };
        let mut buf = Vec::new();
        req.serialize_into(&mut buf).unwrap();
        assert_eq!(vec![0, 0, 0, 2, b'/', b'w', 1], buf);
    }
}
