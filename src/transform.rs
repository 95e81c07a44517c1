//! Maps raw replies onto the typed results of the `NodeStore` operations.
//!
//! Session-level reply codes (connection loss, expiry) never reach these functions; they are
//! turned into `error::Session` by the session before the reply is handed out.

use failure::{bail, format_err};

use crate::proto::{Reply, Response, ZkError};
use crate::{error, Stat};

pub(crate) fn create(res: Reply) -> Result<Result<String, error::Create>, failure::Error> {
    match res {
        Ok(Response::String(s)) => Ok(Ok(s)),
        Ok(r) => bail!("got non-string response to create: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::Create::NoParent)),
        Err(ZkError::NodeExists) => Ok(Err(error::Create::NodeExists)),
        Err(ZkError::InvalidACL) => Ok(Err(error::Create::InvalidAcl)),
        Err(ZkError::NoChildrenForEphemerals) => Ok(Err(error::Create::NoChildrenForEphemerals)),
        Err(e) => Err(format_err!("create call failed: {:?}", e)),
    }
}

pub(crate) fn set_data(
    version: i32,
    res: Reply,
) -> Result<Result<Stat, error::SetData>, failure::Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Ok(stat)),
        Ok(r) => bail!("got a non-stat response to a set_data request: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::SetData::NoNode)),
        Err(ZkError::BadVersion) => Ok(Err(error::SetData::BadVersion { expected: version })),
        Err(ZkError::NoAuth) => Ok(Err(error::SetData::NoAuth)),
        Err(e) => bail!("set_data call failed: {:?}", e),
    }
}

pub(crate) fn delete(version: i32, res: Reply) -> Result<Result<(), error::Delete>, failure::Error> {
    match res {
        Ok(Response::Empty) => Ok(Ok(())),
        Ok(r) => bail!("got non-empty response to delete: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::Delete::NoNode)),
        Err(ZkError::NotEmpty) => Ok(Err(error::Delete::NotEmpty)),
        Err(ZkError::BadVersion) => Ok(Err(error::Delete::BadVersion { expected: version })),
        Err(e) => Err(format_err!("delete call failed: {:?}", e)),
    }
}

pub(crate) fn exists(res: Reply) -> Result<Option<Stat>, failure::Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Some(stat)),
        Ok(r) => bail!("got a non-stat response to an exists request: {:?}", r),
        Err(ZkError::NoNode) => Ok(None),
        Err(e) => bail!("exists call failed: {:?}", e),
    }
}

pub(crate) fn get_children(res: Reply) -> Result<Option<Vec<String>>, failure::Error> {
    match res {
        Ok(Response::Strings(children)) => Ok(Some(children)),
        Ok(r) => bail!("got non-strings response to get-children: {:?}", r),
        Err(ZkError::NoNode) => Ok(None),
        Err(e) => Err(format_err!("get-children call failed: {:?}", e)),
    }
}

pub(crate) fn get_data(res: Reply) -> Result<Option<(Vec<u8>, Stat)>, failure::Error> {
    match res {
        Ok(Response::GetData { bytes, stat }) => Ok(Some((bytes, stat))),
        Ok(r) => bail!("got non-data response to get-data: {:?}", r),
        Err(ZkError::NoNode) => Ok(None),
        Err(e) => Err(format_err!("get-data call failed: {:?}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_without_parent_is_a_logic_error() {
        assert_eq!(
            Err(error::Create::NoParent),
            create(Err(ZkError::NoNode)).unwrap()
        );
        assert_eq!(
            Err(error::Create::NodeExists),
            create(Err(ZkError::NodeExists)).unwrap()
        );
    }

    #[test]
    fn bad_version_reports_expectation() {
        assert_eq!(
            Err(error::SetData::BadVersion { expected: 4 }),
            set_data(4, Err(ZkError::BadVersion)).unwrap()
        );
        assert_eq!(
            Err(error::Delete::BadVersion { expected: 1 }),
            delete(1, Err(ZkError::BadVersion)).unwrap()
        );
    }

    #[test]
    fn missing_nodes_read_as_none() {
        assert_eq!(None, get_data(Err(ZkError::NoNode)).unwrap());
        assert_eq!(None, exists(Err(ZkError::NoNode)).unwrap());
        assert_eq!(None, get_children(Err(ZkError::NoNode)).unwrap());
    }

    #[test]
    fn mismatched_response_is_a_failure() {
        assert!(create(Ok(Response::Empty)).is_err());
        assert!(get_data(Err(ZkError::MarshallingError)).is_err());
    }
}
