//! Actionable recommendations per root-cause category.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{RootCause, RootCauseCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Priority::Critical
        } else if confidence >= 0.6 {
            Priority::High
        } else if confidence >= 0.4 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub category: RootCauseCategory,
    pub priority: Priority,
    pub effort: Effort,
    pub expected_impact: String,
    pub steps: Vec<String>,
    pub verification: Vec<String>,
    /// Root cause that produced this recommendation.
    pub root_cause_id: String,
}

struct Template {
    id: &'static str,
    title: &'static str,
    effort: Effort,
    expected_impact: &'static str,
    steps: &'static [&'static str],
    verification: &'static [&'static str],
}

fn templates(category: RootCauseCategory) -> &'static [Template] {
    match category {
        RootCauseCategory::ResourceExhaustion => &[
            Template {
                id: "scale_resources",
                title: "Scale resources for the affected agent",
                effort: Effort::Low,
                expected_impact: "Removes immediate resource pressure",
                steps: &[
                    "Raise memory and CPU limits for the affected agent type",
                    "Add replicas or enable autoscaling on resource usage",
                    "Set alerts at 80% utilisation",
                ],
                verification: &[
                    "Memory and CPU stay below 80% under normal load",
                    "No resource exhaustion errors for 24 hours",
                ],
            },
            Template {
                id: "profile_memory_growth",
                title: "Profile memory growth",
                effort: Effort::Medium,
                expected_impact: "Finds leaks that scaling only postpones",
                steps: &[
                    "Capture heap profiles at start-up and under sustained load",
                    "Compare allocations to find unbounded caches or buffers",
                    "Bound or evict the offending structures",
                ],
                verification: &["Heap size plateaus in a 12 hour soak test"],
            },
        ],
        RootCauseCategory::InfrastructureFailure => &[Template {
            id: "improve_monitoring",
            title: "Improve infrastructure monitoring",
            effort: Effort::Medium,
            expected_impact: "Detects infrastructure faults before agents fail",
            steps: &[
                "Add health checks for databases, queues and network links",
                "Alert on connection errors and latency percentiles",
                "Add retries with exponential backoff at the client edge",
            ],
            verification: &[
                "Injected infrastructure faults raise alerts within one minute",
                "Transient faults recover without operator action",
            ],
        }],
        RootCauseCategory::ConfigurationIssue => &[Template {
            id: "add_config_validation",
            title: "Validate configuration at start-up",
            effort: Effort::Low,
            expected_impact: "Fails fast on bad settings instead of at runtime",
            steps: &[
                "Define a schema for every agent setting",
                "Validate configuration on start-up and on reload",
                "Diff deployed configuration against the expected baseline",
            ],
            verification: &["Invalid configuration is rejected before the agent serves work"],
        }],
        RootCauseCategory::CodeDefect => &[Template {
            id: "fix_and_redeploy",
            title: "Fix the defect and redeploy",
            effort: Effort::High,
            expected_impact: "Removes the failure at its source",
            steps: &[
                "Reproduce the failure with the captured context",
                "Write a regression test covering the failing path",
                "Fix, review and roll out behind a canary",
            ],
            verification: &[
                "Regression test passes",
                "Error rate for this fingerprint drops to zero after rollout",
            ],
        }],
        RootCauseCategory::ExternalDependency => &[Template {
            id: "add_dependency_fallback",
            title: "Add a fallback for the external dependency",
            effort: Effort::Medium,
            expected_impact: "Keeps agents serving while the dependency is down",
            steps: &[
                "Wrap dependency calls in a circuit breaker",
                "Serve cached or degraded responses while it is open",
            ],
            verification: &["Dependency outage drills complete without agent failures"],
        }],
        RootCauseCategory::DataIssue => &[Template {
            id: "repair_data",
            title: "Repair and validate affected data",
            effort: Effort::High,
            expected_impact: "Stops corrupted records from re-triggering failures",
            steps: &[
                "Identify affected records from the error context",
                "Restore from backup or repair in place",
                "Add integrity checks on write",
            ],
            verification: &["Integrity checks pass for the affected data set"],
        }],
        RootCauseCategory::Unknown => &[Template {
            id: "collect_diagnostics",
            title: "Collect more diagnostics",
            effort: Effort::Low,
            expected_impact: "Gives the next analysis enough evidence to conclude",
            steps: &[
                "Enable debug logging for the affected agent",
                "Attach stack traces and environment snapshots to error reports",
            ],
            verification: &["The next occurrence yields a root cause above 0.6 confidence"],
        }],
    }
}

/// Recommendations for every cause, deduplicated by id (highest priority
/// wins) and sorted by priority, highest first.
pub fn generate(causes: &[RootCause]) -> Vec<Recommendation> {
    let mut unique: HashMap<&'static str, Recommendation> = HashMap::new();
    for cause in causes {
        let priority = Priority::from_confidence(cause.confidence);
        for template in templates(cause.category) {
            if unique
                .get(template.id)
                .map(|existing| existing.priority >= priority)
                .unwrap_or(false)
            {
                continue;
            }
            unique.insert(
                template.id,
                Recommendation {
                    id: template.id.to_string(),
                    title: template.title.to_string(),
                    category: cause.category,
                    priority,
                    effort: template.effort,
                    expected_impact: template.expected_impact.to_string(),
                    steps: template.steps.iter().map(|s| s.to_string()).collect(),
                    verification: template.verification.iter().map(|s| s.to_string()).collect(),
                    root_cause_id: cause.id.clone(),
                },
            );
        }
    }
    let mut recommendations: Vec<Recommendation> = unique.into_values().collect();
    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    recommendations
}
