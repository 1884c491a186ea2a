use crate::entity::Entity;
use crate::evaluator::EvaluationContext;
use crate::query::{LocalPredicate, Operator};

/// AND / OR / NOT over compiled child predicates.
///
/// AND and OR fold left to right and stop at the first deciding child.
pub struct LogicalEvaluator;

impl LogicalEvaluator {
    pub fn evaluate(
        &self,
        op: Operator,
        children: &[LocalPredicate],
        entity: &Entity,
        ctx: &EvaluationContext<'_>,
    ) -> bool {
        match op {
            Operator::And => children.iter().all(|child| child(entity, ctx)),
            Operator::Or => children.iter().any(|child| child(entity, ctx)),
            Operator::Not => !children.first().is_some_and(|child| child(entity, ctx)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ComparisonOptions, NoLookup};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_and_stops_at_first_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let never: LocalPredicate = Arc::new(|_: &Entity, _: &EvaluationContext<'_>| false);
        let counted: LocalPredicate = Arc::new(move |_: &Entity, _: &EvaluationContext<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let children = vec![never, counted];
        let options = ComparisonOptions::default();
        let ctx = EvaluationContext::new(&NoLookup, &options);
        let entity = Entity::new("Order");
        assert!(!LogicalEvaluator.evaluate(Operator::And, &children, &entity, &ctx));
        assert!(LogicalEvaluator.evaluate(Operator::Or, &children, &entity, &ctx));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(LogicalEvaluator.evaluate(Operator::Not, &children[..1], &entity, &ctx));
    }
}
