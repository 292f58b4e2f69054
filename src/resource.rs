use std::sync::Arc;

use http::Method;

/// One node of a request profile: an HTTP request plus the resources that
/// are fetched once its response has begun.
///
/// A node without a path is a *group*: it issues no request of its own, its
/// children are started immediately and in parallel.
#[derive(Debug, Clone)]
pub struct Resource {
    pub(crate) path: Option<String>,
    pub(crate) method: Method,
    pub(crate) response_length: u64,
    pub(crate) request_length: u64,
    pub(crate) children: Vec<Arc<Resource>>,
}

impl Resource {
    /// A resource fetched from `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            method: Method::GET,
            response_length: 0,
            request_length: 0,
            children: Vec::new(),
        }
    }

    /// A pure grouping node: no request, children issued in parallel.
    pub fn group() -> Self {
        Self {
            path: None,
            method: Method::GET,
            response_length: 0,
            request_length: 0,
            children: Vec::new(),
        }
    }

    /// Set the HTTP method, `GET` by default.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Ask the server for a response body of exactly `length` bytes.
    /// Zero leaves the response size to the server.
    pub fn response_length(mut self, length: u64) -> Self {
        self.response_length = length;
        self
    }

    /// Attach a request body of `length` zero bytes.
    pub fn request_length(mut self, length: u64) -> Self {
        self.request_length = length;
        self
    }

    /// Append a child resource, issued once this node's response has begun.
    pub fn child(mut self, child: Resource) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn children(&self) -> &[Arc<Resource>] {
        &self.children
    }

    /// Post-order traversal over the subtree, children before parents.
    pub fn walk<F>(&self, visitor: &mut F)
    where
        F: FnMut(&Resource),
    {
        for child in &self.children {
            child.walk(visitor);
        }
        visitor(self);
    }

    /// The number of requests one traversal of this subtree issues.
    /// Group nodes contribute nothing.
    pub fn count(&self) -> usize {
        let mut total = 0;
        self.walk(&mut |resource| {
            if resource.path.is_some() {
                total += 1;
            }
        });
        total
    }
}

/// The outcome of a single occurrence of a [`Resource`].
///
/// Timestamps are monotonic nanoseconds on a process-wide timebase; only
/// their differences are meaningful.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    resource: Arc<Resource>,
    pub(crate) request_start_nanos: u64,
    pub(crate) response_begin_nanos: u64,
    pub(crate) response_end_nanos: u64,
    pub(crate) status: u16,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl ResourceInfo {
    pub(crate) fn new(resource: Arc<Resource>) -> Self {
        Self {
            resource,
            request_start_nanos: 0,
            response_begin_nanos: 0,
            response_end_nanos: 0,
            status: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn request_start_nanos(&self) -> u64 {
        self.request_start_nanos
    }

    pub fn response_begin_nanos(&self) -> u64 {
        self.response_begin_nanos
    }

    pub fn response_end_nanos(&self) -> u64 {
        self.response_end_nanos
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time from request submission to the first response byte.
    pub fn latency_nanos(&self) -> u64 {
        self.response_begin_nanos
            .saturating_sub(self.request_start_nanos)
    }

    /// Time from request submission to the last response byte.
    pub fn response_time_nanos(&self) -> u64 {
        self.response_end_nanos
            .saturating_sub(self.request_start_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_skips_group_nodes() {
        let tree = Resource::group()
            .child(Resource::new("/a").child(Resource::new("/a/1")))
            .child(Resource::new("/b"));

        assert_eq!(tree.count(), 3);
        assert_eq!(Resource::group().count(), 0);
        assert_eq!(Resource::new("/").count(), 1);
    }

    #[test]
    fn walk_is_post_order() {
        let tree = Resource::new("/")
            .child(Resource::new("/1").child(Resource::new("/11")))
            .child(Resource::new("/2"));

        let mut visited = Vec::new();
        tree.walk(&mut |resource| {
            visited.push(resource.path().unwrap_or("<group>").to_string());
        });

        assert_eq!(visited, vec!["/11", "/1", "/2", "/"]);
    }

    #[test]
    fn derived_timings() {
        let mut info = ResourceInfo::new(Arc::new(Resource::new("/")));
        info.request_start_nanos = 1_000;
        info.response_begin_nanos = 4_000;
        info.response_end_nanos = 9_000;

        assert_eq!(info.latency_nanos(), 3_000);
        assert_eq!(info.response_time_nanos(), 8_000);
    }
}
