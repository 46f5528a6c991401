//! Envelope of the lines gadgets publish on their output stream.
use crate::container::Container;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Normal,
    Err,
    Warn,
    Debug,
    Info,
    Ready,
}

/// One gadget event, serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
}

impl Event {
    pub fn new(kind: EventType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node: String::new(),
            namespace: String::new(),
            pod: String::new(),
            container: String::new(),
        }
    }

    pub fn ready() -> Self {
        Self::new(EventType::Ready, "")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Err, message)
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_container(mut self, container: &Container) -> Self {
        self.namespace = container.namespace.clone();
        self.pod = container.podname.clone();
        self.container = container.name.clone();
        self
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerID;

    #[test]
    fn test_to_line_omits_empty_fields() {
        assert_eq!(Event::ready().to_line().unwrap(), r#"{"type":"ready"}"#);
        assert_eq!(
            Event::error("boom").with_node("node-1").to_line().unwrap(),
            r#"{"type":"err","message":"boom","node":"node-1"}"#
        );
    }

    #[test]
    fn test_with_container() {
        let mut c = Container::new(ContainerID::new("abc").unwrap(), 1);
        c.namespace = "default".to_owned();
        c.podname = "web-0".to_owned();
        c.name = "nginx".to_owned();
        let line = Event::new(EventType::Normal, "exec")
            .with_container(&c)
            .to_line()
            .unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.kind, EventType::Normal);
        assert_eq!(back.pod, "web-0");
        assert_eq!(back.container, "nginx");
    }
}
