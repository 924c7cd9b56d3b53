use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, RequiredAction, RequiredActionType,
    TimeBasedConfig,
};

/// Opens a resource inside a `[startDate, endDate]` window.
pub struct TimeBasedEvaluator;

impl RuleEvaluator for TimeBasedEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::TimeBased
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::TimeBased(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        if let (Some(start), Some(end)) = (cfg.start_date, cfg.end_date) {
            if start > end {
                return Err(GatingError::InvalidConfiguration {
                    rule_id: ctx.rule.id.clone(),
                    message: "startDate is after endDate".to_string(),
                });
            }
        }

        if cfg.include_time {
            Ok(evaluate_instants(cfg, ctx.now))
        } else {
            let tz: Tz = cfg
                .timezone
                .parse()
                .map_err(|_| GatingError::InvalidConfiguration {
                    rule_id: ctx.rule.id.clone(),
                    message: format!("unknown timezone `{}`", cfg.timezone),
                })?;
            Ok(evaluate_dates(cfg, tz, ctx.now))
        }
    }
}

fn evaluate_instants(cfg: &TimeBasedConfig, now: DateTime<Utc>) -> PartialDecision {
    if let Some(start) = cfg.start_date {
        if now < start {
            let when = start.format("%Y-%m-%d %H:%M UTC").to_string();
            return not_yet_open(&when, start);
        }
    }
    if let Some(end) = cfg.end_date {
        if now > end {
            return closed(&end.format("%Y-%m-%d %H:%M UTC").to_string());
        }
        // open through `end` inclusive
        if let Some(closes) = end.checked_add_signed(TimeDelta::nanoseconds(1)) {
            return PartialDecision::satisfied().until(closes);
        }
    }
    PartialDecision::satisfied()
}

/// Calendar-date comparison in the configured zone; the time of day of
/// `startDate`/`endDate` is ignored.
fn evaluate_dates(cfg: &TimeBasedConfig, tz: Tz, now: DateTime<Utc>) -> PartialDecision {
    let today = now.with_timezone(&tz).date_naive();

    if let Some(start) = cfg.start_date {
        let start_day = start.with_timezone(&tz).date_naive();
        if today < start_day {
            let unlock = start_of_day(tz, start_day).unwrap_or(start);
            return not_yet_open(&format!("{} ({})", start_day, tz.name()), unlock);
        }
    }
    if let Some(end) = cfg.end_date {
        let end_day = end.with_timezone(&tz).date_naive();
        if today > end_day {
            return closed(&format!("{} ({})", end_day, tz.name()));
        }
        if let Some(closes) = end_day.succ_opt().and_then(|next| start_of_day(tz, next)) {
            return PartialDecision::satisfied().until(closes);
        }
    }
    PartialDecision::satisfied()
}

fn start_of_day(tz: Tz, day: NaiveDate) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&day.and_time(NaiveTime::MIN))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn not_yet_open(when: &str, unlock: DateTime<Utc>) -> PartialDecision {
    PartialDecision::locked(format!("Available from {when}"))
        .with_unlock(unlock)
        .with_action(RequiredAction::new(
            RequiredActionType::Wait,
            format!("Wait until {when}"),
        ))
}

fn closed(when: &str) -> PartialDecision {
    PartialDecision::locked(format!("Access closed on {when}")).with_action(RequiredAction::new(
        RequiredActionType::Other,
        "The access window for this content has ended; contact your instructor",
    ))
}
