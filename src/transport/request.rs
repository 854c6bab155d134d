use bytes::Bytes;

/// One outgoing request: space-joined directives plus an empty terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub directives: String,
}

impl Request {
    /// Wire frames: the directive text, then an empty frame.
    pub fn into_frames(self) -> Vec<Bytes> {
        vec![Bytes::from(self.directives), Bytes::new()]
    }
}

/// Builds requests for the upstream merger.
#[derive(Debug)]
pub struct RequestComposer {
    select: String,
    reset_merger: bool,
    schema_pending: bool,
}

impl RequestComposer {
    pub fn new(select: impl Into<String>, reset_merger: bool, request_streamers: bool) -> Self {
        Self {
            select: select.into(),
            reset_merger,
            schema_pending: request_streamers,
        }
    }

    /// Composes the next request. The schema directive is only ever
    /// emitted once.
    pub fn compose(&mut self) -> Request {
        let mut directives: Vec<String> = Vec::with_capacity(3);
        if !self.select.is_empty() {
            directives.push(format!("select={}", self.select));
        }
        if self.reset_merger {
            directives.push("ResetOnRequest".to_string());
        }
        if std::mem::take(&mut self.schema_pending) {
            directives.push("SchemaOnRequest".to_string());
        }

        Request {
            directives: directives.join(" "),
        }
    }
}
