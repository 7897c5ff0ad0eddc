use async_trait::async_trait;
use nuptial_bus::{MessageBus, MessageHandler};
use nuptial_core::message::TaskGoal;
use nuptial_core::{BudgetAllocation, Category, CoreConfig, Error, Message, Payload, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Output of one distribution pass: the allocation plus the categories
/// whose declared floor could not be met and should search relaxed.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub allocation: BudgetAllocation,
    pub relaxed: Vec<Category>,
}

/// Proportional baseline, raised to known minimum-spend floors, scaled
/// back down when the floors overshoot the total. Always ends with
/// `allocation.total() <= total`.
pub fn distribute(
    total: f64,
    weights: [f64; 3],
    floors: &[(Category, f64)],
) -> Result<Distribution> {
    if !total.is_finite() || total <= 0.0 {
        return Err(Error::BudgetExceeded(format!(
            "cannot distribute non-positive budget {}",
            total
        )));
    }
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        return Err(Error::Validation("category weights sum to zero".to_string()));
    }

    let mut allocation = BudgetAllocation::default();
    for (i, category) in Category::ALL.iter().enumerate() {
        allocation.set(*category, total * weights[i] / weight_sum);
    }
    for (category, floor) in floors {
        if allocation.get(*category) < *floor {
            allocation.set(*category, *floor);
        }
    }

    let mut relaxed = Vec::new();
    if allocation.total() > total {
        allocation = allocation.scaled_to(total);
        for (category, floor) in floors {
            if allocation.get(*category) + f64::EPSILON < *floor {
                relaxed.push(*category);
            }
        }
        debug!(?relaxed, "Floors overshot total budget, scaled down");
    }
    Ok(Distribution { allocation, relaxed })
}

/// Shift a fraction of every other category's headroom into the failing
/// one, then re-clip to the total. Headroom is the allocation above the
/// category's committed spend, so a resolved category never drops below
/// the price of its chosen candidate. Invoked after a `NotFound`.
pub fn reallocate(
    current: BudgetAllocation,
    failing: Category,
    fraction: f64,
    total: f64,
    committed: &[(Category, f64)],
) -> BudgetAllocation {
    let spent = |category: Category| {
        committed
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, price)| *price)
            .unwrap_or(0.0)
    };
    let mut next = current;
    let mut shifted = 0.0;
    for category in Category::ALL {
        if category == failing {
            continue;
        }
        let headroom = (next.get(category) - spent(category)).max(0.0);
        if headroom <= 0.0 {
            continue;
        }
        let delta = headroom * fraction;
        next.set(category, next.get(category) - delta);
        shifted += delta;
    }
    next.set(failing, next.get(failing) + shifted);
    next.scaled_to(total)
}

/// Stateless worker answering `distribute_budget` tasks on its own topic.
pub struct BudgetDistributorAgent {
    bus: Arc<MessageBus>,
    cfg: CoreConfig,
}

impl BudgetDistributorAgent {
    pub fn new(bus: Arc<MessageBus>, cfg: CoreConfig) -> Self {
        Self { bus, cfg }
    }
}

#[async_trait]
impl MessageHandler for BudgetDistributorAgent {
    async fn handle(&self, msg: &Message) -> Result<()> {
        let Payload::Task(req) = &msg.payload else {
            debug!(message_id = %msg.id, "Ignoring non-task payload");
            return Ok(());
        };
        let TaskGoal::DistributeBudget {
            floors,
            failing,
            current,
            committed,
        } = &req.goal
        else {
            return Err(Error::Validation(
                "budget distributor received a search task".to_string(),
            ));
        };

        let total = req.criteria.presupuesto_total;
        let result = match (failing, current) {
            (Some(category), Some(current)) => {
                let allocation = reallocate(
                    *current,
                    *category,
                    self.cfg.reallocation_fraction,
                    total,
                    committed,
                );
                info!(
                    session_id = %req.session_id,
                    failing = %category,
                    total = allocation.total(),
                    "Reallocated budget toward failing category"
                );
                Distribution {
                    allocation,
                    relaxed: vec![*category],
                }
            }
            _ => distribute(total, self.cfg.category_weights, floors)?,
        };

        self.bus.publish(
            &msg.sender,
            &msg.topic,
            msg.correlation_id,
            Payload::BudgetDone {
                task_id: req.task_id,
                session_id: req.session_id.clone(),
                allocation: result.allocation,
                relaxed: result.relaxed,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EQUAL: [f64; 3] = [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];

    #[test]
    fn test_equal_baseline() {
        let d = distribute(50000.0, EQUAL, &[]).unwrap();
        assert!((d.allocation.venue - 16666.67).abs() < 0.01);
        assert!((d.allocation.catering - 16666.67).abs() < 0.01);
        assert!((d.allocation.decor - 16666.67).abs() < 0.01);
        assert!(d.allocation.total() <= 50000.0 + 1e-6);
        assert!(d.relaxed.is_empty());
    }

    #[test]
    fn test_floor_raises_share() {
        let d = distribute(30000.0, EQUAL, &[(Category::Venue, 15000.0)]).unwrap();
        assert!(d.allocation.venue >= 15000.0 * (30000.0 / 35000.0) - 1e-6);
        assert!(d.allocation.total() <= 30000.0 + 1e-6);
    }

    #[test]
    fn test_unsatisfiable_floors_scale_and_flag() {
        let floors = [(Category::Venue, 30000.0), (Category::Catering, 25000.0)];
        let d = distribute(40000.0, EQUAL, &floors).unwrap();
        assert!(d.allocation.total() <= 40000.0 + 1e-6);
        assert!(d.relaxed.contains(&Category::Venue));
        assert!(d.relaxed.contains(&Category::Catering));
    }

    #[test]
    fn test_non_positive_budget_rejected() {
        assert!(matches!(
            distribute(0.0, EQUAL, &[]),
            Err(Error::BudgetExceeded(_))
        ));
    }

    // Scenario: 50000 total, equal thirds, venue reports NotFound; 10% of
    // catering and decor headroom moves into venue.
    #[test]
    fn test_reallocation_shifts_headroom_into_failing_category() {
        let d = distribute(50000.0, EQUAL, &[]).unwrap();
        let next = reallocate(d.allocation, Category::Venue, 0.10, 50000.0, &[]);
        assert!((next.catering - 15000.0).abs() < 0.01);
        assert!((next.decor - 15000.0).abs() < 0.01);
        assert!((next.venue - 20000.0).abs() < 0.01);
        assert!(next.total() <= 50000.0 + 1e-6);
    }

    #[test]
    fn test_reallocation_preserves_invariant_repeatedly() {
        let mut alloc = distribute(50000.0, EQUAL, &[]).unwrap().allocation;
        for _ in 0..10 {
            alloc = reallocate(alloc, Category::Decor, 0.10, 50000.0, &[]);
            assert!(alloc.total() <= 50000.0 + 1e-6);
        }
    }

    // Catering already chose a 9900 candidate against a 10000 share; no
    // amount of venue reallocation may cut its allocation below that.
    #[test]
    fn test_reallocation_spares_committed_spend() {
        let mut alloc = distribute(30000.0, EQUAL, &[]).unwrap().allocation;
        let committed = [(Category::Catering, 9900.0)];
        for _ in 0..3 {
            alloc = reallocate(alloc, Category::Venue, 0.10, 30000.0, &committed);
            assert!(alloc.catering >= 9900.0);
            assert!(alloc.total() <= 30000.0 + 1e-6);
        }
        assert!(alloc.venue > 10000.0);
    }
}
