//! Category-keyed repair dispatch.
//!
//! The repairer itself holds no fix logic; it routes every defect to the
//! [`RepairStrategy`] registered for its category and collects the outcomes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Defect, DefectCategory, DefectRepairOutcome, RepairReport, Repairer};

/// Outcome of applying one strategy to one defect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub repaired: bool,
    pub detail: Option<String>,
}

impl StrategyOutcome {
    pub fn repaired() -> Self {
        Self {
            repaired: true,
            detail: None,
        }
    }

    pub fn not_repaired(detail: impl Into<String>) -> Self {
        Self {
            repaired: false,
            detail: Some(detail.into()),
        }
    }
}

/// A fix procedure for one class of defect.
#[async_trait]
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Try to fix `defect`.
    ///
    /// # Errors
    ///
    /// An error is recorded as a failed repair of this defect; it does not
    /// abort the remaining repairs.
    async fn apply(&self, defect: &Defect) -> Result<StrategyOutcome>;
}

/// Repairer that dispatches to a [`RepairStrategy`] per [`DefectCategory`].
#[derive(Default, Clone)]
pub struct StrategyRepairer {
    strategies: BTreeMap<DefectCategory, Arc<dyn RepairStrategy>>,
}

impl StrategyRepairer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the strategy for `category`.
    #[must_use]
    pub fn with_strategy(
        mut self,
        category: DefectCategory,
        strategy: Arc<dyn RepairStrategy>,
    ) -> Self {
        self.strategies.insert(category, strategy);
        self
    }

    /// Categories that have a registered strategy.
    pub fn categories(&self) -> impl Iterator<Item = &DefectCategory> {
        self.strategies.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl std::fmt::Debug for StrategyRepairer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRepairer")
            .field("categories", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Repairer for StrategyRepairer {
    fn name(&self) -> &str {
        "strategy-repairer"
    }

    fn can_repair(&self, defect: &Defect) -> bool {
        defect.remediable && self.strategies.contains_key(&defect.category)
    }

    async fn repair(&self, defects: &[Defect]) -> Result<RepairReport> {
        let mut outcomes = Vec::with_capacity(defects.len());

        for defect in defects {
            let Some(strategy) = self.strategies.get(&defect.category) else {
                outcomes.push(DefectRepairOutcome {
                    category: defect.category,
                    message: defect.message.clone(),
                    succeeded: false,
                    detail: Some(format!("no strategy for {} defects", defect.category)),
                });
                continue;
            };

            let outcome = match strategy.apply(defect).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "Repair strategy failed");
                    StrategyOutcome::not_repaired(e.to_string())
                }
            };
            debug!(
                strategy = strategy.name(),
                repaired = outcome.repaired,
                "Applied repair strategy"
            );

            outcomes.push(DefectRepairOutcome {
                category: defect.category,
                message: defect.message.clone(),
                succeeded: outcome.repaired,
                detail: outcome.detail,
            });
        }

        Ok(RepairReport::from_outcomes(outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct AlwaysFixes;

    #[async_trait]
    impl RepairStrategy for AlwaysFixes {
        fn name(&self) -> &str {
            "always"
        }

        async fn apply(&self, _defect: &Defect) -> Result<StrategyOutcome> {
            Ok(StrategyOutcome::repaired())
        }
    }

    struct Explodes;

    #[async_trait]
    impl RepairStrategy for Explodes {
        fn name(&self) -> &str {
            "explodes"
        }

        async fn apply(&self, _defect: &Defect) -> Result<StrategyOutcome> {
            bail!("patch did not apply")
        }
    }

    #[test]
    fn test_can_repair_requires_strategy_and_remediable() {
        let repairer =
            StrategyRepairer::new().with_strategy(DefectCategory::Runtime, Arc::new(AlwaysFixes));

        assert!(repairer.can_repair(&Defect::new(DefectCategory::Runtime, "boom")));
        assert!(!repairer.can_repair(
            &Defect::new(DefectCategory::Runtime, "boom").with_remediable(false)
        ));
        assert!(!repairer.can_repair(&Defect::new(DefectCategory::Markup, "no alt")));
    }

    #[tokio::test]
    async fn test_repair_dispatches_by_category() {
        let repairer = StrategyRepairer::new()
            .with_strategy(DefectCategory::Runtime, Arc::new(AlwaysFixes))
            .with_strategy(DefectCategory::Network, Arc::new(Explodes));

        let defects = vec![
            Defect::new(DefectCategory::Runtime, "TypeError"),
            Defect::new(DefectCategory::Network, "500 on /api"),
            Defect::new(DefectCategory::Markup, "unclosed div"),
        ];

        let report = repairer.repair(&defects).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(
            report.outcomes[1].detail.as_deref(),
            Some("patch did not apply")
        );
        assert!(report.outcomes[2]
            .detail
            .as_deref()
            .unwrap()
            .contains("no strategy"));
    }

    #[test]
    fn test_categories_listing() {
        let repairer = StrategyRepairer::new()
            .with_strategy(DefectCategory::Usability, Arc::new(AlwaysFixes))
            .with_strategy(DefectCategory::Runtime, Arc::new(AlwaysFixes));
        let categories: Vec<_> = repairer.categories().copied().collect();
        assert_eq!(
            categories,
            vec![DefectCategory::Runtime, DefectCategory::Usability]
        );
        assert!(!repairer.is_empty());
    }
}
