use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OfferError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub rating_score: f64,
    pub experience_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl fmt::Display for OfferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfferOutcome::Pending => "pending",
            OfferOutcome::Accepted => "accepted",
            OfferOutcome::Rejected => "rejected",
            OfferOutcome::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentOffer {
    pub id: Uuid,
    pub order_id: Uuid,
    pub rider_id: Uuid,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub distance_km: f64,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub outcome: OfferOutcome,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AssignmentOffer {
    pub fn is_pending(&self) -> bool {
        self.outcome == OfferOutcome::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Fixes the outcome. A resolved offer never changes again.
    pub fn resolve(&mut self, outcome: OfferOutcome, at: DateTime<Utc>) -> Result<(), OfferError> {
        if outcome == OfferOutcome::Pending {
            return Err(OfferError::PendingOutcome);
        }
        if self.outcome != OfferOutcome::Pending {
            return Err(OfferError::AlreadyResolved(self.outcome));
        }

        self.outcome = outcome;
        self.resolved_at = Some(at);
        Ok(())
    }
}

/// Every offer ever made for one order, oldest first.
///
/// Offers are grouped in rounds: a round ends when the order is marked
/// delayed and a new one begins when dispatch is retried. Riders already
/// offered the order in the current round are not offered it again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferLedger {
    pub offers: Vec<AssignmentOffer>,
    pub round_start: usize,
    pub delayed: bool,
}

impl OfferLedger {
    pub fn current(&self) -> Option<&AssignmentOffer> {
        self.offers.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut AssignmentOffer> {
        self.offers.last_mut()
    }

    pub fn pending(&self) -> Option<&AssignmentOffer> {
        self.current().filter(|offer| offer.is_pending())
    }

    pub fn round_attempts(&self) -> usize {
        self.offers.len().saturating_sub(self.round_start)
    }

    pub fn offered_this_round(&self, rider_id: Uuid) -> bool {
        self.offers[self.round_start.min(self.offers.len())..]
            .iter()
            .any(|offer| offer.rider_id == rider_id)
    }

    pub fn push(&mut self, offer: AssignmentOffer) -> Result<(), OfferError> {
        if self.pending().is_some() {
            return Err(OfferError::AlreadyPending);
        }
        self.delayed = false;
        self.offers.push(offer);
        Ok(())
    }

    pub fn begin_round(&mut self) {
        self.round_start = self.offers.len();
        self.delayed = false;
    }
}
