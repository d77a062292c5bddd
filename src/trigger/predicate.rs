// =============================================================================
// Trigger predicates and pre-dispatch guards
// =============================================================================
//
//   side   action              kind         fires when
//   long   open / addition     condition    current <= target
//   long   take_profit         condition    current >= target
//   short  open / addition     condition    current >= target
//   short  take_profit         condition    current <= target
//   any    any                 immediate    always
// =============================================================================

use crate::types::{ActionType, Side, TriggerType, WatchCondition};

pub fn should_trigger(condition: &WatchCondition, current: f64) -> bool {
    if condition.trigger_type == TriggerType::Immediate {
        return true;
    }
    let entering = matches!(condition.action_type, ActionType::Open | ActionType::Addition);
    match (condition.side, entering) {
        (Side::Long, true) | (Side::Short, false) => current <= condition.target_price,
        (Side::Long, false) | (Side::Short, true) => current >= condition.target_price,
    }
}

/// Short opens are refused while funding is below `threshold`. Returns the
/// rejection reason.
pub fn funding_guard(condition: &WatchCondition, funding_rate: f64, threshold: f64) -> Option<String> {
    if condition.side != Side::Short || condition.action_type != ActionType::Open {
        return None;
    }
    if funding_rate < threshold {
        return Some(format!(
            "funding rate {:.4}% is below the short-open threshold {:.4}%",
            funding_rate * 100.0,
            threshold * 100.0
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::tests::condition;

    fn cond(side: Side, action: ActionType, target: f64) -> WatchCondition {
        condition("t", "BTCUSDT", side, action, target)
    }

    #[test]
    fn predicate_table() {
        let cases = [
            (Side::Long, ActionType::Open, 100.0, 100.0, true),
            (Side::Long, ActionType::Open, 100.01, 100.0, false),
            (Side::Long, ActionType::Addition, 90.0, 100.0, true),
            (Side::Long, ActionType::TakeProfit, 100.0, 100.0, true),
            (Side::Long, ActionType::TakeProfit, 99.0, 100.0, false),
            (Side::Short, ActionType::Open, 101.0, 100.0, true),
            (Side::Short, ActionType::Addition, 99.0, 100.0, false),
            (Side::Short, ActionType::TakeProfit, 95.0, 100.0, true),
            (Side::Short, ActionType::TakeProfit, 105.0, 100.0, false),
        ];
        for (side, action, current, target, expected) in cases {
            assert_eq!(
                should_trigger(&cond(side, action, target), current),
                expected,
                "{side} {action} current={current} target={target}"
            );
        }
    }

    #[test]
    fn immediate_always_fires() {
        for price in [0.0001, 1.0, 1e9] {
            let mut c = cond(Side::Long, ActionType::TakeProfit, 100.0);
            c.trigger_type = TriggerType::Immediate;
            assert!(should_trigger(&c, price));
        }
    }

    #[test]
    fn funding_guard_only_blocks_short_opens() {
        let short_open = cond(Side::Short, ActionType::Open, 100.0);
        assert!(funding_guard(&short_open, -0.005, -0.002).is_some());
        assert!(funding_guard(&short_open, -0.002, -0.002).is_none());
        assert!(funding_guard(&short_open, 0.0001, -0.002).is_none());

        let short_add = cond(Side::Short, ActionType::Addition, 100.0);
        assert!(funding_guard(&short_add, -0.005, -0.002).is_none());
        let long_open = cond(Side::Long, ActionType::Open, 100.0);
        assert!(funding_guard(&long_open, -0.005, -0.002).is_none());
    }
}
