//! Envelope codecs for tiers that store opaque bytes

use crate::{CacheError, CacheValueHolder, Cacheable};

/// Turns envelopes into bytes and back. The engine never looks at the bytes.
pub trait ValueCodec<V>: Send + Sync + 'static {
    fn encode(&self, holder: &CacheValueHolder<V>) -> Result<Vec<u8>, CacheError>;

    fn decode(&self, bytes: &[u8]) -> Result<CacheValueHolder<V>, CacheError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V: Cacheable> ValueCodec<V> for JsonCodec {
    fn encode(&self, holder: &CacheValueHolder<V>) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(holder)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheValueHolder<V>, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_json_codec_keeps_expiry() {
        let holder = CacheValueHolder::new(Some("v".to_owned()), 1_000, Duration::from_secs(2));
        let bytes = JsonCodec.encode(&holder).unwrap();
        let decoded: CacheValueHolder<String> = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded.expire_time(), 3_000);
        assert_eq!(decoded.value().map(String::as_str), Some("v"));
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let err = ValueCodec::<String>::decode(&JsonCodec, b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
