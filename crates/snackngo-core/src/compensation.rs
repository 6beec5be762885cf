use snackngo_db::models::AwardRow;
use snackngo_types::models::{CompensationCategory, OrderStatus};
use uuid::Uuid;

use crate::order::Order;
use crate::user::User;

/// Amounts paid out on completion, per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationRule {
    pub submission_credit_cents: i64,
    pub raffle_base_cents: i64,
}

impl Default for CompensationRule {
    fn default() -> Self {
        Self {
            submission_credit_cents: 500,
            raffle_base_cents: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Award {
    pub user_id: Uuid,
    pub category: CompensationCategory,
    pub amount_cents: i64,
    pub raffle_entry: bool,
}

impl Award {
    pub fn to_row(&self) -> AwardRow {
        AwardRow {
            user_id: self.user_id.to_string(),
            amount: self.amount_cents,
            raffle_entry: self.raffle_entry,
        }
    }
}

impl CompensationRule {
    /// Compute the award for a just-completed order and stamp it on the
    /// order. Returns `None` for anything but a first completion, and for
    /// orders whose owner is gone.
    pub fn award(&self, order: &mut Order, user: Option<&User>, now: i64) -> Option<Award> {
        if order.status != OrderStatus::Completed || order.compensation_awarded_at.is_some() {
            return None;
        }

        let user = user.filter(|u| Some(u.id) == order.user_id)?;
        let (amount_cents, raffle_entry) = match user.compensation_category {
            CompensationCategory::SubmissionCount => (self.submission_credit_cents, false),
            CompensationCategory::StagedRaffle => (self.raffle_base_cents, true),
        };

        order.compensation_cents = amount_cents;
        order.compensation_awarded_at = Some(now);

        Some(Award {
            user_id: user.id,
            category: user.compensation_category,
            amount_cents,
            raffle_entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snackngo_types::models::UserStatus;

    fn user(sequence_number: i64) -> User {
        User {
            id: Uuid::new_v4(),
            username: format!("user{}", sequence_number),
            email: "u@example.com".into(),
            total_compensation_cents: 0,
            status: UserStatus::Active,
            sequence_number,
            compensation_category: CompensationCategory::for_sequence(sequence_number),
            created_at: 0,
        }
    }

    fn completed_for(user: &User) -> Order {
        let mut order = Order::new(Uuid::new_v4(), Some(user.id), "C1", 0);
        order.status = OrderStatus::Completed;
        order
    }

    #[test]
    fn sequence_three_enters_the_raffle() {
        let rule = CompensationRule::default();
        let u = user(3);
        let mut order = completed_for(&u);
        let award = rule.award(&mut order, Some(&u), 10).unwrap();
        assert_eq!(award.category, CompensationCategory::StagedRaffle);
        assert!(award.raffle_entry);
        assert_eq!(award.amount_cents, 0);
    }

    #[test]
    fn sequence_four_gets_submission_credit() {
        let rule = CompensationRule::default();
        let u = user(4);
        let mut order = completed_for(&u);
        let award = rule.award(&mut order, Some(&u), 10).unwrap();
        assert_eq!(award.category, CompensationCategory::SubmissionCount);
        assert_eq!(award.amount_cents, 500);
        assert_eq!(order.compensation_cents, 500);
        assert_eq!(order.compensation_awarded_at, Some(10));
    }

    #[test]
    fn awards_once_and_never_on_rejection() {
        let rule = CompensationRule::default();
        let u = user(2);
        let mut order = completed_for(&u);
        assert!(rule.award(&mut order, Some(&u), 10).is_some());
        assert!(rule.award(&mut order, Some(&u), 11).is_none());

        let mut rejected = completed_for(&u);
        rejected.status = OrderStatus::Rejected;
        assert!(rule.award(&mut rejected, Some(&u), 10).is_none());
        assert_eq!(rejected.compensation_cents, 0);
    }

    #[test]
    fn ownerless_order_gets_nothing() {
        let rule = CompensationRule::default();
        let u = user(2);
        let mut order = completed_for(&u);
        order.user_id = None;
        assert!(rule.award(&mut order, Some(&u), 10).is_none());
        assert!(rule.award(&mut order, None, 10).is_none());
    }
}
