use serde_json::Value;

const DEFAULT_LIMIT: usize = 100;

/// Equality filter with ordering and pagination.
#[derive(Debug, Clone)]
pub struct Query {
    filters: Vec<(String, Value)>,
    /// (field, descending)
    order_by: Vec<(String, bool)>,
    limit: usize,
    offset: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    pub fn with_filter(
        mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn with_order(
        mut self,
        field: &str,
        rev: bool,
    ) -> Self {
        self.order_by.push((field.to_string(), rev));
        self
    }

    pub fn with_limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(
        mut self,
        offset: usize,
    ) -> Self {
        self.offset = offset;
        self
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn order_by(&self) -> &[(String, bool)] {
        &self.order_by
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}
