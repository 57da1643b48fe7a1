//! Payment gateway
//!
//! Real payment processing is out of scope; renewals charge through this
//! trait so the lifecycle engine can be exercised with deterministic
//! outcomes in tests while production runs the stochastic simulation.

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

/// Outcome of a single charge attempt. No retry happens at this layer; a
/// decline goes straight to the expire transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Approved { reference: String },
    Declined { reason: String },
}

impl PaymentOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, PaymentOutcome::Approved { .. })
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, user_id: Uuid, amount_cents: i64, description: &str) -> PaymentOutcome;
}

/// Stochastic stub: approves with a fixed probability (default 95%).
pub struct SimulatedPaymentGateway {
    approval_rate: f64,
}

impl SimulatedPaymentGateway {
    pub fn new(approval_rate: f64) -> Self {
        Self { approval_rate }
    }
}

impl Default for SimulatedPaymentGateway {
    fn default() -> Self {
        Self::new(0.95)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn charge(&self, user_id: Uuid, amount_cents: i64, description: &str) -> PaymentOutcome {
        let draw = rand::rng().random::<f64>();
        if draw >= self.approval_rate {
            tracing::warn!(
                user_id = %user_id,
                amount_cents = amount_cents,
                description = description,
                "Simulated payment declined"
            );
            return PaymentOutcome::Declined {
                reason: "Payment declined: insufficient funds".to_string(),
            };
        }
        PaymentOutcome::Approved {
            reference: format!("sim_{}", Uuid::new_v4().simple()),
        }
    }
}

/// Test double with a predetermined outcome.
pub struct FixedPaymentGateway {
    approve: bool,
}

impl FixedPaymentGateway {
    pub fn approving() -> Self {
        Self { approve: true }
    }

    pub fn declining() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl PaymentGateway for FixedPaymentGateway {
    async fn charge(&self, _user_id: Uuid, _amount_cents: i64, _description: &str) -> PaymentOutcome {
        if self.approve {
            PaymentOutcome::Approved {
                reference: "fixed_ok".to_string(),
            }
        } else {
            PaymentOutcome::Declined {
                reason: "Payment declined: insufficient funds".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_approving_simulation_approves() {
        let gateway = SimulatedPaymentGateway::new(1.0);
        let outcome = gateway.charge(Uuid::new_v4(), 999, "renewal").await;
        assert!(outcome.is_approved());
    }

    #[tokio::test]
    async fn never_approving_simulation_declines() {
        let gateway = SimulatedPaymentGateway::new(0.0);
        let outcome = gateway.charge(Uuid::new_v4(), 999, "renewal").await;
        assert!(!outcome.is_approved());
    }

    #[tokio::test]
    async fn fixed_gateway_is_deterministic() {
        assert!(FixedPaymentGateway::approving()
            .charge(Uuid::new_v4(), 1, "x")
            .await
            .is_approved());
        assert!(!FixedPaymentGateway::declining()
            .charge(Uuid::new_v4(), 1, "x")
            .await
            .is_approved());
    }
}
