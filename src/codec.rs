// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON payload codec.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError
    })
}

/// Decodes a payload, keeping the serde error so it can be reported as a handling failure.
pub fn decode<M: DeserializeOwned>(payload: &[u8]) -> Result<M, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
        note: String,
    }

    #[test]
    fn decode_rejects_foreign_payload() {
        let result = decode::<OrderPlaced>(br#"{"unexpected": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn encode_produces_json() {
        let bytes = encode(&OrderPlaced {
            id: 3,
            note: "gift".to_owned(),
        })
        .unwrap();

        assert_eq!(bytes, br#"{"id":3,"note":"gift"}"#);
    }
}
