use crate::store::request::RequestRecord;
use crate::store::schema::{
    EXCEPTION, HTTP_REQUESTS, INDEX_NAME, OPERATION, SHARD_ID, SHARD_REQUESTS, SHARD_ROLE, STATUS,
};

/// Output columns of shard-attributed metrics.
pub const SHARD_DIMENSIONS: &[&str] = &[SHARD_ID, INDEX_NAME, OPERATION, SHARD_ROLE];

/// Output columns of HTTP request metrics.
pub const HTTP_DIMENSIONS: &[&str] = &[OPERATION, STATUS, EXCEPTION];

/// Dimension key for shard-level metrics.
/// Used by thread correlation, thread categorization and shard workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardDimension {
    pub shard_id: Option<String>,
    pub index_name: Option<String>,
    pub operation: Option<String>,
    pub shard_role: Option<String>,
}

impl ShardDimension {
    /// Key of a shard request record.
    pub fn of_request(rec: &RequestRecord) -> Self {
        let schema = &SHARD_REQUESTS;
        let get = |name: &str| {
            schema
                .dimension_index(name)
                .and_then(|i| rec.dim(i))
                .map(str::to_string)
        };

        Self {
            shard_id: get(SHARD_ID),
            index_name: get(INDEX_NAME),
            operation: get(OPERATION),
            shard_role: get(SHARD_ROLE),
        }
    }

    /// Values in `SHARD_DIMENSIONS` order.
    pub fn into_values(self) -> Vec<Option<String>> {
        vec![self.shard_id, self.index_name, self.operation, self.shard_role]
    }
}

/// Dimension key for HTTP request metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HttpDimension {
    pub operation: Option<String>,
    pub status: Option<String>,
    pub exception: Option<String>,
}

impl HttpDimension {
    pub fn of_request(rec: &RequestRecord) -> Self {
        let schema = &HTTP_REQUESTS;
        let get = |name: &str| {
            schema
                .dimension_index(name)
                .and_then(|i| rec.dim(i))
                .map(str::to_string)
        };

        Self {
            operation: get(OPERATION),
            status: get(STATUS),
            exception: get(EXCEPTION),
        }
    }

    /// Values in `HTTP_DIMENSIONS` order.
    pub fn into_values(self) -> Vec<Option<String>> {
        vec![self.operation, self.status, self.exception]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn test_shard_dimension_from_request() {
        let rec = RequestRecord {
            dims: vec![s("r1"), s("7"), s("shardbulk"), s("logs"), s("2"), s("primary")],
            start: Some(1),
            finish: None,
            doc_count: None,
        };

        let key = ShardDimension::of_request(&rec);
        assert_eq!(
            key.clone().into_values(),
            vec![s("2"), s("logs"), s("shardbulk"), s("primary")]
        );

        let mut map: HashMap<ShardDimension, u32> = HashMap::new();
        *map.entry(key.clone()).or_default() += 1;
        *map.entry(key).or_default() += 1;
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_http_dimension_from_request() {
        let rec = RequestRecord {
            dims: vec![s("h1"), s("search"), s("logs"), s("500"), None],
            start: Some(1),
            finish: Some(2),
            doc_count: None,
        };

        assert_eq!(
            HttpDimension::of_request(&rec).into_values(),
            vec![s("search"), s("500"), None]
        );
    }
}
