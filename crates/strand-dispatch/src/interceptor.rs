//! Media-type codecs for request payloads and replies.
//!
//! A [`ReaderInterceptor`] turns the `data` field of a request into named
//! body values for a resource; a [`WriterInterceptor`] turns a reply value
//! back into the `data` string. Both are selected by media type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::exception::DispatchError;
use crate::resource::Resource;

/// Decodes request payloads of one media type.
pub trait ReaderInterceptor: Send + Sync {
    /// Media type handled.
    fn media_type(&self) -> &str;

    /// Extract the body parameters of `resource` from `data`.
    fn read(
        &self,
        resource: &Resource,
        data: Option<&str>,
    ) -> Result<Map<String, Value>, DispatchError>;
}

/// Encodes reply values of one media type.
pub trait WriterInterceptor: Send + Sync {
    /// Media type handled.
    fn media_type(&self) -> &str;

    /// Encode `value` as the response `data`.
    fn write(&self, value: &Value) -> Result<String, DispatchError>;
}

/// JSON payload reader.
///
/// An object payload binds each body parameter to the field of the same
/// name. Any other payload binds whole when the resource has exactly one
/// body parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReader;

impl ReaderInterceptor for JsonReader {
    fn media_type(&self) -> &str {
        "json"
    }

    fn read(
        &self,
        resource: &Resource,
        data: Option<&str>,
    ) -> Result<Map<String, Value>, DispatchError> {
        let mut bound = Map::new();
        let Some(data) = data.filter(|d| !d.trim().is_empty()) else {
            return Ok(bound);
        };

        let parsed: Value =
            serde_json::from_str(data).map_err(|e| DispatchError::ParamValidation {
                param: "data".into(),
                message: format!("not valid json: {e}"),
            })?;

        let body: Vec<_> = resource.body_params().collect();
        match parsed {
            Value::Object(mut fields) => {
                for spec in &body {
                    if let Some(value) = fields.remove(&spec.name) {
                        bound.insert(spec.name.clone(), value);
                    }
                }
                // A single object-typed parameter may take the whole payload.
                if bound.is_empty()
                    && let [only] = body.as_slice()
                    && only.ty == crate::resource::ParamType::Object
                {
                    bound.insert(only.name.clone(), Value::Object(fields));
                }
            }
            other => match body.as_slice() {
                [only] => {
                    bound.insert(only.name.clone(), other);
                }
                [] => {}
                _ => {
                    return Err(DispatchError::ParamValidation {
                        param: "data".into(),
                        message: "expected an object for multiple parameters".into(),
                    });
                }
            },
        }
        Ok(bound)
    }
}

/// JSON reply writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWriter;

impl WriterInterceptor for JsonWriter {
    fn media_type(&self) -> &str {
        "json"
    }

    fn write(&self, value: &Value) -> Result<String, DispatchError> {
        serde_json::to_string(value).map_err(|e| DispatchError::Encode(e.to_string()))
    }
}

/// Readers and writers keyed by media type.
#[derive(Clone, Default)]
pub struct Interceptors {
    readers: HashMap<String, Arc<dyn ReaderInterceptor>>,
    writers: HashMap<String, Arc<dyn WriterInterceptor>>,
}

impl Interceptors {
    /// No interceptors at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The JSON reader and writer.
    pub fn json() -> Self {
        let mut set = Self::empty();
        set.add_reader(Arc::new(JsonReader));
        set.add_writer(Arc::new(JsonWriter));
        set
    }

    /// Register a reader, replacing any for the same media type.
    pub fn add_reader(&mut self, reader: Arc<dyn ReaderInterceptor>) {
        self.readers.insert(reader.media_type().to_string(), reader);
    }

    /// Register a writer, replacing any for the same media type.
    pub fn add_writer(&mut self, writer: Arc<dyn WriterInterceptor>) {
        self.writers.insert(writer.media_type().to_string(), writer);
    }

    /// Reader for `media_type`.
    pub fn reader(&self, media_type: &str) -> Result<&Arc<dyn ReaderInterceptor>, DispatchError> {
        self.readers
            .get(media_type)
            .ok_or_else(|| DispatchError::MediaTypeNotSupported(media_type.to_string()))
    }

    /// Writer for `media_type`.
    pub fn writer(&self, media_type: &str) -> Result<&Arc<dyn WriterInterceptor>, DispatchError> {
        self.writers
            .get(media_type)
            .ok_or_else(|| DispatchError::MediaTypeNotSupported(media_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::HandlerError;
    use crate::resource::{ParamSpec, ParamType, Params, Reply};
    use serde_json::json;

    fn noop(_: &Params) -> Result<Reply, HandlerError> {
        Ok(Reply::Empty)
    }

    #[test]
    fn test_object_fields_bind_by_name() {
        let resource = Resource::new("login", noop)
            .param(ParamSpec::body("username", ParamType::String))
            .param(ParamSpec::body("password", ParamType::String));
        let bound = JsonReader
            .read(
                &resource,
                Some(r#"{"username":"joe","password":"pw","extra":1}"#),
            )
            .unwrap();
        assert_eq!(bound.get("username"), Some(&json!("joe")));
        assert_eq!(bound.get("password"), Some(&json!("pw")));
        assert!(!bound.contains_key("extra"));
    }

    #[test]
    fn test_scalar_binds_to_single_param() {
        let resource =
            Resource::new("echo", noop).param(ParamSpec::body("msg", ParamType::String));
        let bound = JsonReader.read(&resource, Some(r#""hello""#)).unwrap();
        assert_eq!(bound.get("msg"), Some(&json!("hello")));
    }

    #[test]
    fn test_whole_object_binds_to_single_object_param() {
        let resource =
            Resource::new("save", noop).param(ParamSpec::body("user", ParamType::Object));
        let bound = JsonReader
            .read(&resource, Some(r#"{"name":"joe"}"#))
            .unwrap();
        assert_eq!(bound.get("user"), Some(&json!({ "name": "joe" })));
    }

    #[test]
    fn test_missing_data_binds_nothing() {
        let resource =
            Resource::new("echo", noop).param(ParamSpec::body("msg", ParamType::String));
        assert!(JsonReader.read(&resource, None).unwrap().is_empty());
        assert!(JsonReader.read(&resource, Some("  ")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_is_a_validation_error() {
        let resource =
            Resource::new("echo", noop).param(ParamSpec::body("msg", ParamType::String));
        let err = JsonReader.read(&resource, Some("{nope")).unwrap_err();
        assert_eq!(err.status_code(), Some("400"));
    }

    #[test]
    fn test_unknown_media_type() {
        let set = Interceptors::json();
        assert!(set.reader("json").is_ok());
        let err = set.reader("xml").err().unwrap();
        assert!(matches!(err, DispatchError::MediaTypeNotSupported(t) if t == "xml"));
        assert!(set.writer("xml").is_err());
    }

    #[test]
    fn test_json_writer() {
        assert_eq!(
            JsonWriter.write(&json!({ "status": "200" })).unwrap(),
            r#"{"status":"200"}"#
        );
    }
}
