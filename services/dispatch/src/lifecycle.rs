//! Order lifecycle management

use crate::error::{DispatchError, DispatchResult};
use crate::order::{OrderRecord, OrderRequest, OrderStatus};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Order lifecycle manager
#[derive(Debug)]
pub struct OrderLifecycleManager {
    /// Valid state transitions
    valid_transitions: FxHashMap<OrderStatus, Vec<OrderStatus>>,
}

impl Default for OrderLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderLifecycleManager {
    /// Create new lifecycle manager
    #[must_use]
    pub fn new() -> Self {
        let mut valid_transitions = FxHashMap::default();

        valid_transitions.insert(OrderStatus::Started, vec![OrderStatus::Cooking]);
        valid_transitions.insert(OrderStatus::Cooking, vec![OrderStatus::Finished]);

        // Terminal
        valid_transitions.insert(OrderStatus::Finished, vec![]);

        Self { valid_transitions }
    }

    /// Validate an incoming request
    pub fn validate_request(&self, request: &OrderRequest) -> DispatchResult<()> {
        if request.id.trim().is_empty() {
            return Err(DispatchError::validation("order id is required"));
        }

        if request.name.trim().is_empty() {
            return Err(DispatchError::validation("order name is required"));
        }

        if request.prep_time <= 0 {
            return Err(DispatchError::validation(format!(
                "prepTime must be a positive number of seconds, got {}",
                request.prep_time
            )));
        }

        Ok(())
    }

    /// Validate state transition
    pub fn validate_transition(
        &self,
        record: &OrderRecord,
        new_status: OrderStatus,
    ) -> DispatchResult<()> {
        let current_status = record.status;

        if let Some(valid_next_states) = self.valid_transitions.get(&current_status)
            && valid_next_states.contains(&new_status)
        {
            debug!("Valid transition: {:?} -> {:?}", current_status, new_status);
            return Ok(());
        }

        Err(DispatchError::InvalidTransition {
            order_id: record.order_id.clone(),
            from: current_status.to_string(),
            to: new_status.to_string(),
        })
    }

    /// Validate and apply a transition to a transient copy.
    ///
    /// The caller still has to persist the record.
    pub fn transition(&self, record: &mut OrderRecord, new_status: OrderStatus) -> DispatchResult<()> {
        self.validate_transition(record, new_status)?;
        record.status = new_status;
        Ok(())
    }

    /// Get next valid states
    #[must_use]
    pub fn get_valid_transitions(&self, status: OrderStatus) -> Vec<OrderStatus> {
        self.valid_transitions
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::DispatchMode;
    use rstest::rstest;

    fn create_test_record() -> OrderRecord {
        let mut record =
            OrderRecord::started(&OrderRequest::new("ext-1", "Pad Thai", 3), DispatchMode::Fifo);
        record.order_id = "ORDER000000001".to_string();
        record
    }

    #[test]
    fn test_valid_transitions() {
        let manager = OrderLifecycleManager::new();
        let mut record = create_test_record();

        assert!(manager.transition(&mut record, OrderStatus::Cooking).is_ok());
        assert!(manager.transition(&mut record, OrderStatus::Finished).is_ok());
        assert_eq!(record.status, OrderStatus::Finished);
    }

    #[rstest]
    #[case(OrderStatus::Started, OrderStatus::Finished)]
    #[case(OrderStatus::Cooking, OrderStatus::Started)]
    #[case(OrderStatus::Finished, OrderStatus::Cooking)]
    #[case(OrderStatus::Finished, OrderStatus::Started)]
    fn test_rejected_transitions(#[case] from: OrderStatus, #[case] to: OrderStatus) {
        let manager = OrderLifecycleManager::new();
        let mut record = create_test_record();
        record.status = from;

        let err = manager.transition(&mut record, to).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
        assert_eq!(record.status, from);
    }

    #[rstest]
    #[case("", "A", 1)]
    #[case("  ", "A", 1)]
    #[case("o1", "", 1)]
    #[case("o1", "A", 0)]
    #[case("o1", "A", -5)]
    fn test_invalid_requests(#[case] id: &str, #[case] name: &str, #[case] prep_time: i64) {
        let manager = OrderLifecycleManager::new();
        let request = OrderRequest::new(id, name, prep_time);
        assert!(matches!(
            manager.validate_request(&request),
            Err(DispatchError::Validation { .. })
        ));
    }

    #[test]
    fn test_terminal_has_no_transitions() {
        let manager = OrderLifecycleManager::new();
        assert!(manager.get_valid_transitions(OrderStatus::Finished).is_empty());
        assert_eq!(
            manager.get_valid_transitions(OrderStatus::Started),
            vec![OrderStatus::Cooking]
        );
    }
}
