//! Pass-through filter, used when no factory is registered.

use std::sync::Arc;

use crate::filter::{FilterCallbacks, FilterConfig, FilterFactory, HttpFilter};

/// A filter that lets every phase continue untouched.
#[derive(Debug, Default)]
pub struct PassThroughFilter;

impl HttpFilter for PassThroughFilter {}

/// Factory producing [`PassThroughFilter`] instances.
#[derive(Debug, Default)]
pub struct PassThroughFactory;

impl FilterFactory for PassThroughFactory {
    fn create(
        &self,
        _config: FilterConfig,
        _callbacks: Arc<dyn FilterCallbacks>,
    ) -> Box<dyn HttpFilter> {
        Box::new(PassThroughFilter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatusType;
    use crate::FilterError;

    struct NoopCallbacks;

    impl FilterCallbacks for NoopCallbacks {
        fn continue_request(&self, _status: StatusType) {}
        fn send_local_reply(&self, _reply: crate::LocalReply) {}
        fn handle_fault(&self, _error: FilterError) {}
        fn route_name(&self) -> Result<String, FilterError> {
            Ok(String::new())
        }
        fn get_dynamic_metadata(
            &self,
            _filter_name: &str,
        ) -> Result<serde_json::Value, FilterError> {
            Ok(serde_json::Value::Null)
        }
        fn set_dynamic_metadata(
            &self,
            _filter_name: &str,
            _key: &str,
            _value: serde_json::Value,
        ) -> Result<(), FilterError> {
            Ok(())
        }
    }

    #[test]
    fn passthrough_continues_every_phase() {
        let factory = PassThroughFactory;
        let config: FilterConfig = Arc::new(Vec::<u8>::new());
        let filter = factory.create(config, Arc::new(NoopCallbacks));

        // The default methods never need the view arguments, so the
        // pass-through behavior is observable without a live request.
        assert!(matches!(
            filter.decode_trailers(&DummyHeaders).unwrap(),
            StatusType::Continue
        ));
        assert!(matches!(
            filter.encode_trailers(&DummyHeaders).unwrap(),
            StatusType::Continue
        ));
    }

    struct DummyHeaders;

    impl crate::HeaderMap for DummyHeaders {
        fn get(&self, _key: &str) -> Result<Option<String>, FilterError> {
            Ok(None)
        }
        fn values(&self, _key: &str) -> Result<Vec<String>, FilterError> {
            Ok(Vec::new())
        }
        fn entries(&self) -> Result<Vec<(String, String)>, FilterError> {
            Ok(Vec::new())
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), FilterError> {
            Ok(())
        }
        fn add(&self, _key: &str, _value: &str) -> Result<(), FilterError> {
            Ok(())
        }
        fn remove(&self, _key: &str) -> Result<(), FilterError> {
            Ok(())
        }
        fn byte_size(&self) -> u64 {
            0
        }
        unsafe fn get_raw(&self, _key: &str) -> Result<crate::RawValue, FilterError> {
            Ok(crate::RawValue::new(std::ptr::null(), 0))
        }
    }
}
