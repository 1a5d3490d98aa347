use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::ResultsError;

const BOUND_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeScaleRule {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub letter: String,
    pub point: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl GradeScaleRule {
    /// Rules are `[lower, upper)`, except the top rule which also owns 100.
    fn contains(&self, percentage: f64) -> bool {
        if percentage < self.lower_bound {
            return false;
        }
        if percentage < self.upper_bound {
            return true;
        }
        (self.upper_bound - 100.0).abs() < BOUND_EPSILON && percentage <= 100.0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeScale {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub created_at: String,
    pub rules: Vec<GradeScaleRule>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub letter: String,
    pub point: f64,
    pub remark: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GradingError {
    #[error("no grade rule covers {percentage}")]
    ScaleGap { percentage: f64 },
    #[error("invalid grade scale: {0}")]
    InvalidScale(String),
}

impl From<GradingError> for ResultsError {
    fn from(e: GradingError) -> Self {
        ResultsError::Configuration(e.to_string())
    }
}

/// VB6-style half-up rounding (`Int(10^n * x + 0.5) / 10^n`), the same
/// convention the mark calculations have always used.
pub fn round_to(x: f64, places: u32) -> f64 {
    let factor = 10_f64.powi(places as i32);
    ((factor * x) + 0.5).floor() / factor
}

pub fn percentage(score: f64, possible: f64) -> f64 {
    if possible > 0.0 {
        100.0 * score / possible
    } else {
        0.0
    }
}

/// Checks that the rules partition [0, 100] and returns them ordered by
/// lower bound.
pub fn validate_rules(rules: &[GradeScaleRule]) -> Result<Vec<GradeScaleRule>, GradingError> {
    if rules.is_empty() {
        return Err(GradingError::InvalidScale("a scale needs at least one rule".into()));
    }
    let mut sorted = rules.to_vec();
    for r in &sorted {
        if !r.lower_bound.is_finite() || !r.upper_bound.is_finite() || !r.point.is_finite() {
            return Err(GradingError::InvalidScale(format!(
                "rule {} has a non-numeric bound or point",
                r.letter
            )));
        }
        if r.letter.trim().is_empty() {
            return Err(GradingError::InvalidScale("rule letter must not be empty".into()));
        }
        if r.lower_bound >= r.upper_bound {
            return Err(GradingError::InvalidScale(format!(
                "rule {} must have lowerBound < upperBound",
                r.letter
            )));
        }
        if r.point < 0.0 {
            return Err(GradingError::InvalidScale(format!(
                "rule {} has a negative point",
                r.letter
            )));
        }
    }
    sorted.sort_by(|a, b| {
        a.lower_bound
            .partial_cmp(&b.lower_bound)
            .unwrap_or(Ordering::Equal)
    });

    let first = &sorted[0];
    if first.lower_bound.abs() > BOUND_EPSILON {
        return Err(GradingError::InvalidScale(format!(
            "gap below {}: rules must start at 0",
            first.lower_bound
        )));
    }
    for pair in sorted.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.lower_bound > prev.upper_bound + BOUND_EPSILON {
            return Err(GradingError::InvalidScale(format!(
                "gap between {} and {}",
                prev.upper_bound, next.lower_bound
            )));
        }
        if next.lower_bound < prev.upper_bound - BOUND_EPSILON {
            return Err(GradingError::InvalidScale(format!(
                "rules {} and {} overlap",
                prev.letter, next.letter
            )));
        }
    }
    let last = &sorted[sorted.len() - 1];
    if (last.upper_bound - 100.0).abs() > BOUND_EPSILON {
        return Err(GradingError::InvalidScale(format!(
            "rules must end at 100, last upper bound is {}",
            last.upper_bound
        )));
    }
    Ok(sorted)
}

pub fn grade_for(percentage: f64, scale: &GradeScale) -> Result<Grade, GradingError> {
    if !percentage.is_finite() {
        return Err(GradingError::ScaleGap { percentage });
    }
    scale
        .rules
        .iter()
        .find(|r| r.contains(percentage))
        .map(|r| Grade {
            letter: r.letter.clone(),
            point: r.point,
            remark: r.remark.clone(),
        })
        .ok_or(GradingError::ScaleGap { percentage })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
}

pub fn class_statistics(scores: &[f64]) -> ClassStatistics {
    if scores.is_empty() {
        return ClassStatistics {
            average: 0.0,
            highest: 0.0,
            lowest: 0.0,
        };
    }
    let sum: f64 = scores.iter().sum();
    let highest = scores.iter().copied().fold(f64::MIN, f64::max);
    let lowest = scores.iter().copied().fold(f64::MAX, f64::min);
    ClassStatistics {
        average: sum / (scores.len() as f64),
        highest,
        lowest,
    }
}

/// Standard competition ranking ("1224"): tied scores share a position and
/// the next distinct score skips by the size of the tie group. Output is in
/// input order.
pub fn rank(scores: &[f64]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut ranks = vec![0_u32; scores.len()];
    let mut current_rank = 0_u32;
    let mut previous: Option<f64> = None;
    for (pos, &idx) in order.iter().enumerate() {
        let score = scores[idx];
        if previous.map(|p| p != score).unwrap_or(true) {
            current_rank = (pos as u32) + 1;
            previous = Some(score);
        }
        ranks[idx] = current_rank;
    }
    ranks
}

pub fn default_scale_rules() -> Vec<GradeScaleRule> {
    let rule = |lower: f64, upper: f64, letter: &str, point: f64, remark: &str| GradeScaleRule {
        lower_bound: lower,
        upper_bound: upper,
        letter: letter.to_string(),
        point,
        remark: Some(remark.to_string()),
    };
    vec![
        rule(0.0, 40.0, "F", 0.0, "Fail"),
        rule(40.0, 45.0, "E", 1.0, "Pass"),
        rule(45.0, 50.0, "D", 2.0, "Fair"),
        rule(50.0, 60.0, "C", 3.0, "Good"),
        rule(60.0, 70.0, "B", 4.0, "Very Good"),
        rule(70.0, 100.0, "A", 5.0, "Excellent"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(lower: f64, upper: f64, letter: &str, point: f64) -> GradeScaleRule {
        GradeScaleRule {
            lower_bound: lower,
            upper_bound: upper,
            letter: letter.to_string(),
            point,
            remark: None,
        }
    }

    fn scale(rules: Vec<GradeScaleRule>) -> GradeScale {
        GradeScale {
            id: "s1".into(),
            name: "Test".into(),
            is_default: true,
            created_at: String::new(),
            rules: validate_rules(&rules).expect("valid rules"),
        }
    }

    #[test]
    fn ties_share_rank_and_next_rank_skips() {
        assert_eq!(rank(&[90.0, 90.0, 80.0]), vec![1, 1, 3]);
        assert_eq!(rank(&[80.0, 90.0, 90.0, 70.0]), vec![3, 1, 1, 4]);
        assert_eq!(rank(&[50.0, 50.0, 50.0]), vec![1, 1, 1]);
        assert!(rank(&[]).is_empty());
    }

    #[test]
    fn ca_and_exam_scenario_maps_to_a() {
        let s = scale(vec![rule(0.0, 75.0, "B", 3.0), rule(75.0, 100.0, "A", 4.0)]);
        let pct = round_to(percentage(32.0 + 55.0, 40.0 + 60.0), 2);
        assert_eq!(pct, 87.0);
        let g = grade_for(pct, &s).expect("grade");
        assert_eq!(g.letter, "A");
        assert_eq!(g.point, 4.0);
    }

    #[test]
    fn every_percentage_maps_to_exactly_one_rule() {
        let s = scale(default_scale_rules());
        for i in 0..=10_000 {
            let p = i as f64 / 100.0;
            let hits = s.rules.iter().filter(|r| r.contains(p)).count();
            assert_eq!(hits, 1, "percentage {} matched {} rules", p, hits);
            assert!(grade_for(p, &s).is_ok());
        }
    }

    #[test]
    fn boundaries_belong_to_the_upper_rule() {
        let s = scale(default_scale_rules());
        assert_eq!(grade_for(70.0, &s).expect("grade").letter, "A");
        assert_eq!(grade_for(69.99, &s).expect("grade").letter, "B");
        assert_eq!(grade_for(100.0, &s).expect("grade").letter, "A");
        assert_eq!(grade_for(0.0, &s).expect("grade").letter, "F");
    }

    #[test]
    fn out_of_range_percentage_is_a_scale_gap() {
        let s = scale(default_scale_rules());
        assert_eq!(
            grade_for(100.5, &s),
            Err(GradingError::ScaleGap { percentage: 100.5 })
        );
        assert!(grade_for(-1.0, &s).is_err());
        assert!(grade_for(f64::NAN, &s).is_err());
    }

    #[test]
    fn validation_rejects_gaps_overlaps_and_short_coverage() {
        let gap = vec![rule(0.0, 60.0, "B", 3.0), rule(61.0, 100.0, "A", 4.0)];
        assert!(matches!(validate_rules(&gap), Err(GradingError::InvalidScale(_))));

        let overlap = vec![rule(0.0, 60.0, "B", 3.0), rule(55.0, 100.0, "A", 4.0)];
        assert!(matches!(validate_rules(&overlap), Err(GradingError::InvalidScale(_))));

        let short_top = vec![rule(0.0, 60.0, "B", 3.0), rule(60.0, 99.0, "A", 4.0)];
        assert!(validate_rules(&short_top).is_err());

        let short_bottom = vec![rule(10.0, 100.0, "A", 4.0)];
        assert!(validate_rules(&short_bottom).is_err());

        assert!(validate_rules(&[]).is_err());
        assert!(validate_rules(&[rule(0.0, 0.0, "Z", 0.0), rule(0.0, 100.0, "A", 1.0)]).is_err());
    }

    #[test]
    fn validation_orders_rules_by_lower_bound() {
        let rules = vec![rule(50.0, 100.0, "A", 4.0), rule(0.0, 50.0, "F", 0.0)];
        let sorted = validate_rules(&rules).expect("valid");
        assert_eq!(sorted[0].letter, "F");
        assert_eq!(sorted[1].letter, "A");
    }

    #[test]
    fn class_statistics_over_percentages() {
        let stats = class_statistics(&[87.0, 60.0, 45.0]);
        assert_eq!(stats.highest, 87.0);
        assert_eq!(stats.lowest, 45.0);
        assert!((stats.average - 64.0).abs() < 1e-9);

        let empty = class_statistics(&[]);
        assert_eq!(empty.average, 0.0);
        assert_eq!(empty.highest, 0.0);
    }

    #[test]
    fn round_to_is_half_up() {
        assert_eq!(round_to(87.0, 2), 87.0);
        assert_eq!(round_to(66.666_666, 2), 66.67);
        assert_eq!(round_to(3.55, 1), 3.6);
        assert_eq!(round_to(35.6818, 1), 35.7);
    }
}
