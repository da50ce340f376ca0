//! Per-pair offer/answer state machine.
//!
//! `PeerLink` holds no media objects and performs no I/O: every input is a
//! discrete event and every output is a list of [`LinkAction`]s for the
//! [`crate::peer::PeerConnectionManager`] to execute in order.

use parley_shared::{NegotiationState, UserId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkReport {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Create a local offer and send it to the remote.
    CreateOffer { ice_restart: bool },
    /// Apply the remote offer, then create and send an answer.
    AcceptOffer(String),
    /// Apply the remote answer.
    ApplyAnswer(String),
    AddCandidate(String),
    /// Replace the outgoing video track in place.
    ReplaceVideo { token: u64 },
    /// (Re)arm the negotiation timeout for `generation`.
    ArmTimer { generation: u64 },
    /// Arm the grace window for in-place swap `token`.
    ArmSwapTimer { token: u64 },
    CancelTimer,
    Report(LinkReport),
}

#[derive(Debug)]
pub struct PeerLink {
    local: UserId,
    remote: UserId,
    initiator: bool,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    generation: u64,
    restarted: bool,
    awaiting_answer: bool,
    swap_token: u64,
    pending_swap: Option<u64>,
}

impl PeerLink {
    pub fn new(local: UserId, remote: UserId) -> Self {
        // The lexicographically smaller id always offers first.
        let initiator = local < remote;
        Self {
            local,
            remote,
            initiator,
            state: NegotiationState::Idle,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            generation: 0,
            restarted: false,
            awaiting_answer: false,
            swap_token: 0,
            pending_swap: None,
        }
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Start negotiating. The initiator offers; the other side waits for
    /// the offer under the same timeout.
    pub fn begin(&mut self) -> Vec<LinkAction> {
        if self.initiator {
            self.state = NegotiationState::OfferSent;
            self.awaiting_answer = true;
            vec![
                LinkAction::CreateOffer { ice_restart: false },
                LinkAction::ArmTimer {
                    generation: self.generation,
                },
            ]
        } else {
            vec![LinkAction::ArmTimer {
                generation: self.generation,
            }]
        }
    }

    pub fn on_offer(&mut self, sdp: String) -> Vec<LinkAction> {
        if self.state == NegotiationState::Failed {
            return Vec::new();
        }
        if self.awaiting_answer && self.initiator {
            debug!(remote = %self.remote.short(), "Offer collision, keeping our offer");
            return Vec::new();
        }
        if self.awaiting_answer {
            debug!(remote = %self.remote.short(), "Offer collision, yielding to remote offer");
            self.awaiting_answer = false;
        }

        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::AnswerPending;
        }
        self.remote_description_set = true;

        let mut actions = vec![LinkAction::AcceptOffer(sdp)];
        actions.extend(self.flush_candidates());
        actions
    }

    pub fn on_answer(&mut self, sdp: String) -> Vec<LinkAction> {
        if !self.awaiting_answer || self.state == NegotiationState::Failed {
            debug!(remote = %self.remote.short(), "Ignoring unexpected answer");
            return Vec::new();
        }
        self.awaiting_answer = false;
        self.remote_description_set = true;

        let mut actions = vec![LinkAction::ApplyAnswer(sdp)];
        actions.extend(self.flush_candidates());
        actions
    }

    /// Candidates that arrive before the remote description are buffered in
    /// arrival order and flushed right after it is applied.
    pub fn on_candidate(&mut self, candidate: String) -> Vec<LinkAction> {
        if self.state == NegotiationState::Failed {
            return Vec::new();
        }
        if self.remote_description_set {
            vec![LinkAction::AddCandidate(candidate)]
        } else {
            self.pending_candidates.push(candidate);
            Vec::new()
        }
    }

    /// First media frame received from the remote.
    pub fn on_media_started(&mut self) -> Vec<LinkAction> {
        match self.state {
            NegotiationState::Connected | NegotiationState::Failed => Vec::new(),
            _ => {
                self.state = NegotiationState::Connected;
                self.restarted = false;
                vec![
                    LinkAction::CancelTimer,
                    LinkAction::Report(LinkReport::Connected),
                ]
            }
        }
    }

    pub fn on_timeout(&mut self, generation: u64) -> Vec<LinkAction> {
        if generation != self.generation
            || matches!(
                self.state,
                NegotiationState::Connected | NegotiationState::Failed
            )
        {
            return Vec::new();
        }
        debug!(remote = %self.remote.short(), generation, "Negotiation timed out");
        self.restart_or_fail()
    }

    pub fn on_transport_failed(&mut self) -> Vec<LinkAction> {
        if self.state == NegotiationState::Failed {
            return Vec::new();
        }
        debug!(remote = %self.remote.short(), "Transport failed");
        self.restart_or_fail()
    }

    /// Swap the outgoing video track. Once connected, the in-place swap gets
    /// a grace window before falling back to renegotiation.
    pub fn begin_swap(&mut self) -> Vec<LinkAction> {
        if self.state == NegotiationState::Failed {
            return Vec::new();
        }
        self.swap_token += 1;
        let token = self.swap_token;
        if self.state == NegotiationState::Connected {
            self.pending_swap = Some(token);
            vec![
                LinkAction::ReplaceVideo { token },
                LinkAction::ArmSwapTimer { token },
            ]
        } else {
            vec![LinkAction::ReplaceVideo { token }]
        }
    }

    pub fn on_swap_acked(&mut self, token: u64) -> Vec<LinkAction> {
        if self.pending_swap == Some(token) {
            self.pending_swap = None;
        }
        Vec::new()
    }

    /// The remote never acknowledged swap `token`: renegotiate.
    pub fn on_swap_timeout(&mut self, token: u64) -> Vec<LinkAction> {
        if self.pending_swap != Some(token) || self.state == NegotiationState::Failed {
            return Vec::new();
        }
        self.pending_swap = None;
        if self.awaiting_answer {
            return Vec::new();
        }
        debug!(remote = %self.remote.short(), token, "Track swap not acknowledged, renegotiating");
        self.awaiting_answer = true;
        vec![LinkAction::CreateOffer { ice_restart: false }]
    }

    fn restart_or_fail(&mut self) -> Vec<LinkAction> {
        if self.restarted {
            self.state = NegotiationState::Failed;
            self.awaiting_answer = false;
            self.pending_candidates.clear();
            self.pending_swap = None;
            return vec![
                LinkAction::CancelTimer,
                LinkAction::Report(LinkReport::Failed),
            ];
        }

        self.restarted = true;
        self.generation += 1;
        self.remote_description_set = false;
        self.pending_candidates.clear();

        if self.initiator {
            debug!(
                local = %self.local.short(),
                remote = %self.remote.short(),
                "Restarting ICE"
            );
            self.state = NegotiationState::OfferSent;
            self.awaiting_answer = true;
            vec![
                LinkAction::CreateOffer { ice_restart: true },
                LinkAction::ArmTimer {
                    generation: self.generation,
                },
            ]
        } else {
            self.state = NegotiationState::Idle;
            self.awaiting_answer = false;
            vec![LinkAction::ArmTimer {
                generation: self.generation,
            }]
        }
    }

    fn flush_candidates(&mut self) -> impl Iterator<Item = LinkAction> {
        std::mem::take(&mut self.pending_candidates)
            .into_iter()
            .map(LinkAction::AddCandidate)
    }
}
