//! Integration tests for order validation.
//!
//! These sweep the configured ranges and check that boundaries, reasons and
//! liabilities line up across the public API.

use domain::{OrderRequest, OrderValidator, Side, ValidationLimits, ValidationReason};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn order(side: Side, stake: Decimal, odds: Decimal) -> OrderRequest {
    OrderRequest {
        user_id: "8d0f4a4e-2f7c-4d4c-9a57-0f3c1d2b9e11".to_string(),
        event_id: "evt-premier-league-123".to_string(),
        market_id: "mkt-match-odds".to_string(),
        selection_id: "sel-home".to_string(),
        side: side.to_string(),
        odds,
        stake,
        currency: "GBP".to_string(),
        idempotency_key: "client-req-42".to_string(),
        metadata: None,
    }
}

mod ranges {
    use super::*;

    #[test]
    fn test_every_in_range_combination_is_valid() {
        let validator = OrderValidator::default();
        let stakes = [dec!(1), dec!(1.01), dec!(37.5), dec!(999.99), dec!(10000)];
        let odds = [dec!(1.01), dec!(1.5), dec!(2), dec!(101.25), dec!(1000)];

        for side in [Side::Back, Side::Lay] {
            for stake in stakes {
                for price in odds {
                    let outcome = validator.validate(&order(side, stake, price));
                    assert!(
                        outcome.valid,
                        "{side} stake={stake} odds={price}: {:?}",
                        outcome.reason
                    );
                }
            }
        }
    }

    #[test]
    fn test_one_unit_outside_each_bound_is_invalid() {
        let validator = OrderValidator::default();
        let cent = dec!(0.01);
        let limits = ValidationLimits::default();

        let cases = [
            (limits.min_stake() - cent, dec!(2), "stake_too_low"),
            (limits.max_stake() + cent, dec!(2), "stake_too_high"),
            (dec!(10), limits.min_odds() - dec!(0.001), "odds_too_low"),
            (dec!(10), limits.max_odds() + cent, "odds_too_high"),
        ];

        for (stake, odds, code) in cases {
            let err = validator
                .check(&order(Side::Back, stake, odds))
                .unwrap_err();
            assert_eq!(err.code(), code, "stake={stake} odds={odds}");
        }
    }
}

mod reasons {
    use super::*;

    #[test]
    fn test_outcome_carries_display_text() {
        let outcome = OrderValidator::default().validate(&order(Side::Lay, dec!(0.5), dec!(2)));
        assert!(!outcome.valid);
        assert_eq!(
            outcome.reason,
            Some(ValidationReason::StakeTooLow { min: dec!(1) }.to_string())
        );
    }

    #[test]
    fn test_missing_idempotency_key_is_reported_by_name() {
        let mut req = order(Side::Back, dec!(10), dec!(2));
        req.idempotency_key.clear();
        assert_eq!(
            OrderValidator::default().check(&req),
            Err(ValidationReason::MissingField("idempotency_key"))
        );
    }
}

mod liability {
    use super::*;

    #[test]
    fn test_reserved_amount_depends_on_side() {
        let back = order(Side::Back, dec!(100), dec!(2.5));
        let lay = order(Side::Lay, dec!(100), dec!(2.5));

        assert_eq!(back.liability().unwrap(), dec!(100));
        assert_eq!(lay.liability().unwrap(), dec!(250.0));
    }
}
