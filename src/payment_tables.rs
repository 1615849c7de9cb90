//! Payment tables: installment terms, schedules and surcharges.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::{round_money, timestamp, PaymentTable, PaymentTerm};

const PERCENT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    pub number: u32,
    #[serde(with = "timestamp")]
    pub due_at: DateTime<Utc>,
    pub amount: f64,
}

/// Terms must be non-empty, each share positive, and the shares must add
/// up to 100 percent.
pub fn validate_terms(terms: &[PaymentTerm]) -> AppResult<()> {
    if terms.is_empty() {
        return Err(AppError::validation("payment table needs at least one term"));
    }
    for (i, term) in terms.iter().enumerate() {
        if !term.percent.is_finite() || term.percent <= 0.0 || term.percent > 100.0 {
            return Err(AppError::validation(format!(
                "term {} has an invalid percent ({})",
                i + 1,
                term.percent
            )));
        }
    }
    let sum: f64 = terms.iter().map(|t| t.percent).sum();
    if (sum - 100.0).abs() > PERCENT_TOLERANCE {
        return Err(AppError::validation(format!(
            "term percents must sum to 100 (got {sum})"
        )));
    }
    Ok(())
}

/// Whether an order of `total` may use this table.
pub fn applies_to(table: &PaymentTable, total: f64) -> bool {
    table.active && total + PERCENT_TOLERANCE / 100.0 >= table.min_order_value
}

/// Order total with the table's surcharge applied.
pub fn surcharged_total(table: &PaymentTable, total: f64) -> f64 {
    round_money(total * (1.0 + table.surcharge_percent / 100.0))
}

/// Split `total` (plus surcharge) into installments due `days` after
/// `issued_at`. Shares are split in whole cents and the leftover lands on
/// the last installment so the amounts add up exactly.
pub fn schedule(
    table: &PaymentTable,
    total: f64,
    issued_at: DateTime<Utc>,
) -> AppResult<Vec<Installment>> {
    validate_terms(&table.terms)?;
    if !total.is_finite() || total < 0.0 {
        return Err(AppError::validation(format!(
            "total must be zero or positive (got {total})"
        )));
    }
    if !applies_to(table, total) {
        return Err(AppError::validation(format!(
            "payment table {:?} requires a minimum order of {:.2} (got {total:.2})",
            table.name, table.min_order_value
        )));
    }

    let grand_total = surcharged_total(table, total);
    let mut terms: Vec<&PaymentTerm> = table.terms.iter().collect();
    terms.sort_by_key(|t| t.days);

    let total_cents = (grand_total * 100.0).round() as i64;
    let mut remaining = total_cents;
    let mut installments = Vec::with_capacity(terms.len());
    for (i, term) in terms.iter().enumerate() {
        // Earlier shares round down so the last one never goes negative.
        let cents = if i + 1 == terms.len() {
            remaining
        } else {
            let share = (total_cents as f64 * term.percent / 100.0 + 1e-6).floor() as i64;
            share.clamp(0, remaining)
        };
        remaining -= cents;
        installments.push(Installment {
            number: (i + 1) as u32,
            due_at: issued_at + Duration::days(i64::from(term.days)),
            amount: cents as f64 / 100.0,
        });
    }
    Ok(installments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn term(days: u32, percent: f64) -> PaymentTerm {
        PaymentTerm { days, percent }
    }

    fn table(terms: Vec<PaymentTerm>) -> PaymentTable {
        PaymentTable {
            name: "30/60/90".into(),
            terms,
            active: true,
            ..PaymentTable::default()
        }
    }

    fn issued() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_validate_terms() {
        assert!(validate_terms(&[term(0, 100.0)]).is_ok());
        assert!(validate_terms(&[term(30, 33.33), term(60, 33.33), term(90, 33.34)]).is_ok());
        assert!(validate_terms(&[]).is_err());
        assert!(validate_terms(&[term(30, 50.0), term(60, 40.0)]).is_err());
        assert!(validate_terms(&[term(30, 0.0), term(60, 100.0)]).is_err());
    }

    #[test]
    fn test_schedule_sums_exactly_to_total() {
        let t = table(vec![term(30, 33.33), term(60, 33.33), term(90, 33.34)]);
        let plan = schedule(&t, 100.0, issued()).unwrap();
        assert_eq!(plan.len(), 3);
        let sum: f64 = plan.iter().map(|i| i.amount).sum();
        assert_eq!(round_money(sum), 100.0);
        assert_eq!(plan[0].amount, 33.33);
        assert_eq!(plan[2].amount, 33.34);
        assert_eq!(plan[1].due_at, issued() + Duration::days(60));

        let odd = table(vec![term(30, 50.0), term(60, 50.0)]);
        let plan = schedule(&odd, 10.01, issued()).unwrap();
        assert_eq!(round_money(plan[0].amount + plan[1].amount), 10.01);
    }

    #[test]
    fn test_schedule_never_produces_negative_installments() {
        let t = table(vec![term(30, 25.0), term(60, 25.0), term(90, 25.0), term(120, 25.0)]);
        let plan = schedule(&t, 0.02, issued()).unwrap();
        let amounts: Vec<f64> = plan.iter().map(|i| i.amount).collect();
        assert_eq!(amounts, vec![0.0, 0.0, 0.0, 0.02]);

        let plan = schedule(&t, 0.06, issued()).unwrap();
        assert!(plan.iter().all(|i| i.amount >= 0.0));
        assert_eq!(round_money(plan.iter().map(|i| i.amount).sum()), 0.06);
    }

    #[test]
    fn test_schedule_orders_terms_by_days() {
        let t = table(vec![term(60, 40.0), term(0, 60.0)]);
        let plan = schedule(&t, 50.0, issued()).unwrap();
        assert_eq!(plan[0].due_at, issued());
        assert_eq!(plan[0].amount, 30.0);
        assert_eq!(plan[1].amount, 20.0);
    }

    #[test]
    fn test_minimum_value_and_surcharge() {
        let mut t = table(vec![term(30, 100.0)]);
        t.min_order_value = 200.0;
        t.surcharge_percent = 2.5;
        assert!(!applies_to(&t, 150.0));
        assert!(schedule(&t, 150.0, issued()).is_err());
        assert!(applies_to(&t, 200.0));

        let plan = schedule(&t, 200.0, issued()).unwrap();
        assert_eq!(plan[0].amount, 205.0);

        t.active = false;
        assert!(!applies_to(&t, 500.0));
    }
}
