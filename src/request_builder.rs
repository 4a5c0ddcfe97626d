//! Client-side request building utilities
//!
//! Helpers for constructing CORECONF request payloads: iFETCH identifier
//! queries, iPATCH instances and RPC invocations. Every payload item is
//! returned as its own CBOR data item, ready to be sent as a CBOR sequence.

use serde_json::Value;

use crate::config::SortMode;
use crate::coreconf::CoreconfModel;
use crate::error::{CoreconfError, Result};
use crate::instance_id::{Instance, InstancePath};
use crate::path::{
    Intent, ResolvedInstance, extract_sids_from_instance_identifier,
    is_instance_identifier_format, parse_instance_identifier_path,
};

/// Client-side request builder for CORECONF operations
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    model: &'a CoreconfModel,
    sort_mode: SortMode,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(model: &'a CoreconfModel, sort_mode: SortMode) -> Self {
        Self { model, sort_mode }
    }

    fn instance_path(&self, resolved: &ResolvedInstance) -> Result<InstancePath> {
        let mut path = InstancePath::new(resolved.sid);
        for key in &resolved.keys {
            path.push_key(self.model.encode_key(&key.identifier, &key.value)?);
        }
        Ok(path)
    }

    /// Build iFETCH queries for paths given as strings or as
    /// instance-identifier objects (values are ignored).
    ///
    /// Paths without a SID are left out of the query.
    pub fn build_fetch(&self, paths: &Value) -> Result<Vec<Vec<u8>>> {
        extract_sids_from_instance_identifier(paths, self.model.sids(), Intent::Query)?
            .iter()
            .map(|resolved| self.instance_path(resolved)?.encode_cbor())
            .collect()
    }

    /// Build iFETCH queries for bare SIDs
    pub fn build_fetch_sids(&self, sids: &[i64]) -> Result<Vec<Vec<u8>>> {
        sids.iter()
            .map(|&sid| InstancePath::new(sid).encode_cbor())
            .collect()
    }

    /// Build iPATCH instances.
    ///
    /// `data` is either instance-identifier pairs (a `null` value deletes
    /// the node) or an RFC 7951 tree, patched one top-level node at a time.
    /// Every path must resolve; nothing is built otherwise.
    pub fn build_ipatch(&self, data: &Value) -> Result<Vec<Vec<u8>>> {
        if is_instance_identifier_format(data) {
            return extract_sids_from_instance_identifier(data, self.model.sids(), Intent::Patch)?
                .iter()
                .map(|resolved| {
                    let value = self.model.encode_instance_value(
                        &resolved.identifier,
                        &resolved.value,
                        self.sort_mode,
                    )?;
                    Instance::new(self.instance_path(resolved)?, value).encode_cbor()
                })
                .collect();
        }

        let tree = data.as_object().ok_or_else(|| {
            CoreconfError::type_conversion("/", "patch data must be instance-identifier pairs or a tree")
        })?;
        tree.iter()
            .map(|(key, value)| {
                let identifier = format!("/{key}");
                let sid = self
                    .model
                    .sids()
                    .get_sid(&identifier)
                    .ok_or_else(|| CoreconfError::SidNotFound(identifier.clone()))?;
                let value = self.model.encode_node(&identifier, value, self.sort_mode)?;
                Instance::new(InstancePath::new(sid), value).encode_cbor()
            })
            .collect()
    }

    /// Build the payload invoking the RPC or action at `rpc_path`
    pub fn build_post(&self, rpc_path: &str, input: Option<&Value>) -> Result<Vec<u8>> {
        parse_instance_identifier_path(rpc_path)?;
        let mut target = serde_json::Map::new();
        target.insert(rpc_path.to_string(), Value::Null);
        let target = Value::Array(vec![Value::Object(target)]);
        let resolved = extract_sids_from_instance_identifier(&target, self.model.sids(), Intent::Patch)?
            .pop()
            .ok_or_else(|| CoreconfError::SidNotFound(rpc_path.to_string()))?;

        let value = match input {
            Some(Value::Object(members)) => self.model.encode_members(
                members,
                &format!("{}/input", resolved.identifier),
                self.sort_mode,
            )?,
            Some(Value::Null) | None => ciborium::Value::Null,
            Some(other) => {
                return Err(CoreconfError::type_conversion(
                    rpc_path,
                    format!("RPC input must be an object, got {other}"),
                ));
            }
        };
        Instance::new(self.instance_path(&resolved)?, value).encode_cbor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_id::decode_instances;
    use ciborium::Value as Cbor;
    use serde_json::json;

    const SAMPLE_SID: &str = r#"{
        "assignment-range": [{"entry-point": 60000, "size": 20}],
        "module-name": "example-1",
        "module-revision": "unknown",
        "item": [
            {"namespace": "module", "identifier": "example-1", "sid": 60000},
            {"namespace": "data", "identifier": "/example-1:greeting", "sid": 60001},
            {"namespace": "data", "identifier": "/example-1:greeting/author", "sid": 60002, "type": "string"},
            {"namespace": "data", "identifier": "/example-1:greeting/message", "sid": 60003, "type": "string"},
            {"namespace": "data", "identifier": "/example-1:users", "sid": 60004},
            {"namespace": "data", "identifier": "/example-1:users/user", "sid": 60005},
            {"namespace": "data", "identifier": "/example-1:users/user/id", "sid": 60006, "type": "uint16"},
            {"namespace": "data", "identifier": "/example-1:users/user/level", "sid": 60007, "type": "uint8"},
            {"namespace": "data", "identifier": "/example-1:reboot", "sid": 60010},
            {"namespace": "data", "identifier": "/example-1:reboot/input", "sid": 60011},
            {"namespace": "data", "identifier": "/example-1:reboot/input/delay", "sid": 60012, "type": "uint32"}
        ],
        "key-mapping": {"60005": [60006]}
    }"#;

    fn model() -> CoreconfModel {
        CoreconfModel::from_sid_str(SAMPLE_SID).unwrap()
    }

    fn decode_one(bytes: &[u8]) -> Cbor {
        ciborium::from_reader(bytes).unwrap()
    }

    #[test]
    fn test_build_fetch() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Velocity);

        let payload = builder
            .build_fetch(&json!(["/example-1:greeting", "/example-1:users/user[id='7']/level"]))
            .unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(decode_one(&payload[0]), Cbor::Integer(60001.into()));
        assert_eq!(
            decode_one(&payload[1]),
            Cbor::Array(vec![Cbor::Integer(60007.into()), Cbor::Integer(7.into())])
        );
    }

    #[test]
    fn test_build_fetch_skips_unknown_paths() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Velocity);
        let payload = builder
            .build_fetch(&json!([{"/example-1:greeting/author": null}, {"/example-1:nope": null}]))
            .unwrap();
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn test_build_fetch_sids() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Velocity);
        let payload = builder.build_fetch_sids(&[60001, 60002]).unwrap();
        assert_eq!(hex::encode(payload.concat()), "19ea6119ea62");
    }

    #[test]
    fn test_build_ipatch_instances() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Rfc8949);

        let payload = builder
            .build_ipatch(&json!([
                {"/example-1:greeting/author": "Luke"},
                {"/example-1:users/user[id='7']": {"level": 3}},
                {"/example-1:greeting/message": null}
            ]))
            .unwrap();
        let instances = decode_instances(&payload.concat()).unwrap();

        assert_eq!(instances[0].path, InstancePath::new(60002));
        assert_eq!(instances[0].value, Cbor::Text("Luke".into()));

        assert_eq!(instances[1].path.sid, 60005);
        assert_eq!(instances[1].path.keys, vec![Cbor::Integer(7.into())]);
        assert_eq!(
            instances[1].value,
            Cbor::Map(vec![(Cbor::Integer(60007.into()), Cbor::Integer(3.into()))])
        );

        assert_eq!(instances[2].value, Cbor::Null);
    }

    #[test]
    fn test_build_ipatch_rejects_unknown_path() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Velocity);
        let err = builder
            .build_ipatch(&json!([{"/example-1:greeting/author": "Luke"}, {"/example-1:nope": 1}]))
            .unwrap_err();
        assert!(matches!(err, CoreconfError::SidNotFound(_)));
    }

    #[test]
    fn test_build_ipatch_from_tree() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Rfc8949);
        let payload = builder
            .build_ipatch(&json!({"example-1:greeting": {"message": "hi", "author": "me"}}))
            .unwrap();
        let instances = decode_instances(&payload.concat()).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].path, InstancePath::new(60001));
        assert_eq!(
            instances[0].value,
            Cbor::Map(vec![
                (Cbor::Integer(60002.into()), Cbor::Text("me".into())),
                (Cbor::Integer(1.into()), Cbor::Text("hi".into())),
            ])
        );
    }

    #[test]
    fn test_build_post() {
        let model = model();
        let builder = RequestBuilder::new(&model, SortMode::Velocity);

        let payload = builder
            .build_post("/example-1:reboot", Some(&json!({"delay": 5})))
            .unwrap();
        let instances = decode_instances(&payload).unwrap();
        assert_eq!(instances[0].path, InstancePath::new(60010));
        assert_eq!(
            instances[0].value,
            Cbor::Map(vec![(Cbor::Integer(60012.into()), Cbor::Integer(5.into()))])
        );

        let bare = builder.build_post("/example-1:reboot", None).unwrap();
        assert_eq!(decode_instances(&bare).unwrap()[0].value, Cbor::Null);

        assert!(matches!(
            builder.build_post("/example-1:shutdown", None),
            Err(CoreconfError::SidNotFound(_))
        ));
        assert!(matches!(
            builder.build_post("example-1:reboot", None),
            Err(CoreconfError::InvalidPath { .. })
        ));
    }
}
