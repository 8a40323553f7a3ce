use std::time::Duration;

use bytes::Bytes;

/// One Server-Sent-Events message.
///
/// ```
/// # use wicket::eventsource::EventSourceMessage;
/// let message = EventSourceMessage::new("hello\nworld").event("greeting").id("7");
/// assert_eq!(
///     message.build(),
///     "id: 7\nevent: greeting\ndata: hello\ndata: world\n\n"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSourceMessage {
    id: Option<String>,
    event: Option<String>,
    retry: Option<Duration>,
    comment: Option<String>,
    data: Option<String>,
}

impl EventSourceMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Reconnection delay the client should use.
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Wire form: one `field: value` line per field, multi-line values split
    /// over several lines, and a blank line to finish the message.
    pub fn build(&self) -> String {
        let mut out = String::new();
        if let Some(comment) = &self.comment {
            push_field(&mut out, "", comment);
        }
        if let Some(id) = &self.id {
            push_field(&mut out, "id", id);
        }
        if let Some(event) = &self.event {
            push_field(&mut out, "event", event);
        }
        if let Some(retry) = self.retry {
            push_field(&mut out, "retry", &retry.as_millis().to_string());
        }
        if let Some(data) = &self.data {
            push_field(&mut out, "data", data);
        }
        out.push('\n');
        out
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        Bytes::from(self.build())
    }
}

/// One `name:` line per line of `value`. A trailing newline yields a final
/// empty line so the client sees it again.
fn push_field(out: &mut String, name: &str, value: &str) {
    for line in value.split('\n') {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
}
