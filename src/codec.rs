//! JSON encoding of procedure inputs and decoding of outputs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;

/// Encode a procedure input into its wire value.
///
/// # Errors
///
/// Returns [`RpcError::Serialization`] if the input cannot be represented as
/// JSON (for example a map with non-string keys).
pub fn encode<I: Serialize + ?Sized>(procedure: &str, input: &I) -> Result<Value, RpcError> {
    serde_json::to_value(input).map_err(|e| RpcError::Serialization {
        procedure: procedure.to_owned(),
        message: e.to_string(),
    })
}

/// Decode a wire value into the declared output type.
///
/// # Errors
///
/// Returns [`RpcError::Deserialization`] if the value does not match `T`.
pub fn decode<T: DeserializeOwned>(procedure: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Deserialization {
        procedure: procedure.to_owned(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct User {
        id: u32,
        name: String,
    }

    #[test]
    fn decodes_matching_shape() {
        let user: User = decode("getUser", json!({ "id": 1, "name": "Ada" })).expect("decode");
        assert_eq!(user, User { id: 1, name: "Ada".into() });
    }

    #[test]
    fn shape_mismatch_names_the_procedure() {
        let err = decode::<User>("getUser", json!({ "id": "not-a-number" })).expect_err("mismatch");
        assert!(
            matches!(err, RpcError::Deserialization { ref procedure, .. } if procedure == "getUser"),
            "{err:?}"
        );
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    enum Role {
        Admin,
        Member { since: u32 },
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Profile {
        user: User,
        role: Role,
        nickname: Option<String>,
        tags: BTreeMap<String, BTreeMap<String, Vec<i64>>>,
    }

    #[test]
    fn typed_values_survive_encode_then_decode() {
        let profile = Profile {
            user: User { id: 1, name: "Ada".into() },
            role: Role::Member { since: 1843 },
            nickname: None,
            tags: BTreeMap::from([
                ("math".to_owned(), BTreeMap::from([("engines".to_owned(), vec![1, -2, 3])])),
                ("empty".to_owned(), BTreeMap::new()),
            ]),
        };

        let encoded = encode("getProfile", &profile).expect("encode");
        assert_eq!(encoded["role"], json!({ "member": { "since": 1843 } }));
        assert_eq!(encoded["nickname"], Value::Null);
        assert_eq!(decode::<Profile>("getProfile", encoded), Ok(profile));

        let admin = Profile {
            user: User { id: 2, name: "Grace".into() },
            role: Role::Admin,
            nickname: Some("amazing".into()),
            tags: BTreeMap::new(),
        };
        let encoded = encode("getProfile", &admin).expect("encode");
        assert_eq!(encoded["role"], json!("admin"));
        assert_eq!(decode::<Profile>("getProfile", encoded), Ok(admin));
    }

    #[test]
    fn non_string_map_keys_fail_to_encode() {
        let input: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err = encode("createUser", &input).expect_err("tuple keys");
        assert!(matches!(err, RpcError::Serialization { ref procedure, .. } if procedure == "createUser"));
    }
}
