//! # Evaluation Rubric
//!
//! The final report scores a presentation against a list of named categories, each
//! with its own maximum. The default rubric totals 100 points.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One rubric category.
///
/// `default_score` is the conservative value used when the rubric scoring call fails
/// entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricCategory {
    pub name: String,
    pub max_score: f64,
    pub default_score: f64,
}

impl RubricCategory {
    pub fn new(name: &str, max_score: f64, default_score: f64) -> Self {
        Self {
            name: name.to_string(),
            max_score,
            default_score,
        }
    }

    /// Clamp a raw score into `[0, max_score]`. Non-finite values count as 0.
    pub fn clamp(&self, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        raw.clamp(0.0, self.max_score)
    }
}

/// The seven-category rubric used for project presentations.
pub fn default_rubric() -> Vec<RubricCategory> {
    vec![
        RubricCategory::new("Project Content", 20.0, 10.0),
        RubricCategory::new("Algorithm Used", 15.0, 7.0),
        RubricCategory::new("Student Skill Level", 15.0, 7.0),
        RubricCategory::new("Slide Design & Visuals", 10.0, 5.0),
        RubricCategory::new("Communication & Delivery", 20.0, 10.0),
        RubricCategory::new("Handling of Questions", 10.0, 5.0),
        RubricCategory::new("Research Process & Methodology", 10.0, 5.0),
    ]
}

/// A category's final score together with its ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub score: f64,
    pub max_score: f64,
}

/// Apply the rubric to raw upstream scores.
///
/// Every rubric category appears exactly once in the output, in rubric order.
/// Categories missing from `raw` score 0; categories in `raw` that the rubric does
/// not know are ignored.
pub fn clamp_scores(rubric: &[RubricCategory], raw: &HashMap<String, f64>) -> Vec<CategoryScore> {
    rubric
        .iter()
        .map(|category| CategoryScore {
            category: category.name.clone(),
            score: raw
                .get(&category.name)
                .map(|value| category.clamp(*value))
                .unwrap_or(0.0),
            max_score: category.max_score,
        })
        .collect()
}

/// The conservative score set substituted when rubric scoring fails.
pub fn default_scores(rubric: &[RubricCategory]) -> Vec<CategoryScore> {
    rubric
        .iter()
        .map(|category| CategoryScore {
            category: category.name.clone(),
            score: category.clamp(category.default_score),
            max_score: category.max_score,
        })
        .collect()
}
