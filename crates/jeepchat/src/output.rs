use serde::Serialize;

/// Prints command results either for people or as one JSON object per line.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

enum Stream {
    Out,
    Err,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        emit(Stream::Out, self.render_success(command, &data));
    }

    pub fn success_message(&self, command: &str, message: &str) {
        let text = if self.json {
            self.render_success(command, &serde_json::json!({ "message": message }))
        } else {
            message.to_string()
        };
        emit(Stream::Out, text);
    }

    pub fn error(&self, message: &str) {
        let text = if self.json {
            to_json(&Envelope::<()> {
                status: "error",
                command: None,
                data: None,
                error: Some(message),
            })
        } else {
            format!("Error: {}", message)
        };
        emit(Stream::Err, text);
    }

    /// One line of `listen` output. JSON events carry their payload fields
    /// next to `event`.
    pub fn event<T: Serialize>(&self, kind: &str, data: T) {
        let text = if self.json {
            to_json(&Event { event: kind, data })
        } else {
            format!("[{}] {}", kind, to_pretty_json(&data))
        };
        emit(Stream::Out, text);
    }

    /// Human status line, kept off stdout and silent in JSON mode.
    pub fn info(&self, message: &str) {
        if !self.json {
            emit(Stream::Err, message.to_string());
        }
    }

    fn render_success<T: Serialize>(&self, command: &str, data: &T) -> String {
        if self.json {
            to_json(&Envelope {
                status: "ok",
                command: Some(command),
                data: Some(data),
                error: None,
            })
        } else {
            to_pretty_json(data)
        }
    }
}

fn emit(stream: Stream, text: String) {
    match stream {
        Stream::Out => println!("{}", text),
        Stream::Err => eprintln!("{}", text),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!("{{\"status\":\"error\",\"error\":\"{}\"}}", e))
}

fn to_pretty_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| e.to_string())
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct Event<'a, T: Serialize> {
    event: &'a str,
    #[serde(flatten)]
    data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_success_is_wrapped() {
        let line = Output::new(true).render_success("send", &serde_json::json!({ "id": "m1" }));
        assert_eq!(line, r#"{"status":"ok","command":"send","data":{"id":"m1"}}"#);
    }

    #[test]
    fn test_human_success_is_bare_data() {
        let line = Output::new(false).render_success("send", &serde_json::json!({ "id": "m1" }));
        assert!(line.contains("\"id\": \"m1\""));
        assert!(!line.contains("status"));
    }

    #[test]
    fn test_event_flattens_data() {
        let event = Event {
            event: "message",
            data: serde_json::json!({ "id": "m1" }),
        };
        assert_eq!(to_json(&event), r#"{"event":"message","id":"m1"}"#);
    }
}
