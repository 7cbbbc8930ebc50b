use crate::{Index, VigilResult};

/// One delivery on a subscription stream. Ordering per correlation id is delivery order.
#[derive(Debug, Clone)]
pub struct UpdateEvent<V> {
    pub correlation_id: String,
    /// Index of the value carried by `result`, or the last good index for an error.
    pub index: Index,
    pub result: VigilResult<V>,
}

impl<V> UpdateEvent<V> {
    pub fn value(correlation_id: impl Into<String>, index: Index, value: V) -> Self {
        Self { correlation_id: correlation_id.into(), index, result: Ok(value) }
    }

    pub fn error(correlation_id: impl Into<String>, index: Index, err: crate::VigilError) -> Self {
        Self { correlation_id: correlation_id.into(), index, result: Err(err) }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}
