/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-sequence-number certification state.
//!
//! Each sequence number in the window has a [`Slot`], which moves through the phases:
//!
//! ```text
//! Pending -> Proposed -> Prepared -> Committed -> Executed
//! ```
//!
//! - `Pending`: votes have arrived, but the pre-prepare has not. Votes are buffered by digest.
//! - `Proposed`: the primary's pre-prepare has been accepted. Buffered votes for any other digest are
//!   dropped.
//! - `Prepared`: the pre-prepare has been tentatively executed and `2f` matching prepares have been
//!   collected.
//! - `Committed`: `2f + 1` matching commits have been collected.
//! - `Executed`: the batch has been written to the ledger. The slot is removed from the log.

use std::collections::BTreeMap;

use crate::execution::ByzInfo;
use crate::types::basic::{CryptoHash, SeqNo, ViewNumber};

use super::{
    messages::{Commit, Prepare},
    pre_prepare::PrePrepare,
    types::{CommitCertificate, Phase, PrepareCertificate, VoteCollector},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    Pending,
    Proposed,
    Prepared,
    Committed,
    Executed,
}

pub(crate) struct Slot {
    pre_prepare: Option<PrePrepare>,
    digest: Option<CryptoHash>,
    phase: SlotPhase,
    tentative: Option<ByzInfo>,
    prepares: VoteCollector,
    commits: VoteCollector,
    commit_certificate: Option<CommitCertificate>,
}

impl Slot {
    fn new(view: ViewNumber, seqno: SeqNo, num_replicas: usize) -> Slot {
        Slot {
            pre_prepare: None,
            digest: None,
            phase: SlotPhase::Pending,
            tentative: None,
            prepares: VoteCollector::new(view, seqno, num_replicas),
            commits: VoteCollector::new(view, seqno, num_replicas),
            commit_certificate: None,
        }
    }
}

/// A vote dropped from a slot because it does not support the accepted pre-prepare.
pub(crate) struct DroppedVote {
    pub(crate) phase: Phase,
    pub(crate) digest: CryptoHash,
    pub(crate) pos: usize,
}

pub(crate) struct CertificationLog {
    view: ViewNumber,
    num_replicas: usize,
    last_executed: SeqNo,
    slots: BTreeMap<SeqNo, Slot>,
}

impl CertificationLog {
    pub(crate) fn new(view: ViewNumber, num_replicas: usize) -> CertificationLog {
        CertificationLog {
            view,
            num_replicas,
            last_executed: SeqNo::init(),
            slots: BTreeMap::new(),
        }
    }

    pub(crate) fn last_executed(&self) -> SeqNo {
        self.last_executed
    }

    /// Restart the log after `last_executed`, discarding every slot.
    pub(crate) fn reset(&mut self, last_executed: SeqNo) {
        self.last_executed = last_executed;
        self.slots.clear();
    }

    pub(crate) fn phase(&self, seqno: SeqNo) -> Option<SlotPhase> {
        if seqno <= self.last_executed {
            return Some(SlotPhase::Executed);
        }
        self.slots.get(&seqno).map(|slot| slot.phase)
    }

    /// Digest of the pre-prepare accepted for `seqno`, if any.
    pub(crate) fn digest(&self, seqno: SeqNo) -> Option<CryptoHash> {
        self.slots.get(&seqno).and_then(|slot| slot.digest)
    }

    pub(crate) fn pre_prepare(&self, seqno: SeqNo) -> Option<&PrePrepare> {
        self.slots.get(&seqno).and_then(|slot| slot.pre_prepare.as_ref())
    }

    /// Accept `pre_prepare` into its slot, returning the buffered votes that do not support it.
    ///
    /// # Preconditions
    /// No pre-prepare has been accepted for the same sequence number.
    pub(crate) fn accept_pre_prepare(&mut self, pre_prepare: PrePrepare) -> Vec<DroppedVote> {
        let seqno = pre_prepare.seqno();
        let digest = pre_prepare.digest();
        let slot = self.slot_mut(seqno);

        let mut dropped: Vec<DroppedVote> = slot
            .prepares
            .retain_only(&digest)
            .into_iter()
            .map(|(digest, pos)| DroppedVote {
                phase: Phase::Prepare,
                digest,
                pos,
            })
            .collect();
        dropped.extend(
            slot.commits
                .retain_only(&digest)
                .into_iter()
                .map(|(digest, pos)| DroppedVote {
                    phase: Phase::Commit,
                    digest,
                    pos,
                }),
        );

        slot.pre_prepare = Some(pre_prepare);
        slot.digest = Some(digest);
        slot.phase = SlotPhase::Proposed;
        dropped
    }

    /// Record the result of tentatively executing the pre-prepare at `seqno`.
    pub(crate) fn set_tentative(&mut self, seqno: SeqNo, byz_info: ByzInfo) {
        if let Some(slot) = self.slots.get_mut(&seqno) {
            slot.tentative = Some(byz_info);
        }
    }

    /// Collect the prepare of the replica at `pos`. If the slot has accepted a pre-prepare with a
    /// different digest, the vote is discarded and that digest is returned.
    pub(crate) fn add_prepare(&mut self, pos: usize, prepare: &Prepare) -> Result<usize, CryptoHash> {
        let slot = self.slot_mut(prepare.seqno);
        match slot.digest {
            Some(digest) if digest != prepare.digest => Err(digest),
            _ => Ok(slot.prepares.collect(pos, prepare)),
        }
    }

    /// Collect the commit of the replica at `pos`. If the slot has accepted a pre-prepare with a
    /// different digest, the vote is discarded and that digest is returned.
    pub(crate) fn add_commit(&mut self, pos: usize, commit: &Commit) -> Result<usize, CryptoHash> {
        let slot = self.slot_mut(commit.seqno);
        match slot.digest {
            Some(digest) if digest != commit.digest => Err(digest),
            _ => Ok(slot.commits.collect(pos, commit)),
        }
    }

    /// If the slot at `seqno` has just become prepared, move it to [`SlotPhase::Prepared`] and return its
    /// prepare certificate.
    pub(crate) fn try_prepare(&mut self, seqno: SeqNo, quorum: usize) -> Option<PrepareCertificate> {
        let view = self.view;
        let slot = self.slots.get_mut(&seqno)?;
        let digest = slot.digest?;
        if slot.phase != SlotPhase::Proposed || slot.tentative.is_none() || slot.prepares.count(&digest) < quorum {
            return None;
        }

        slot.phase = SlotPhase::Prepared;
        Some(PrepareCertificate {
            view,
            seqno,
            digest,
            signatures: slot.prepares.signatures(&digest),
        })
    }

    /// If the slot at `seqno` has just become committed, move it to [`SlotPhase::Committed`] and return its
    /// commit certificate.
    pub(crate) fn try_commit(&mut self, seqno: SeqNo, quorum: usize) -> Option<CommitCertificate> {
        let view = self.view;
        let slot = self.slots.get_mut(&seqno)?;
        let digest = slot.digest?;
        if slot.phase != SlotPhase::Prepared || slot.commits.count(&digest) < quorum {
            return None;
        }

        let certificate = CommitCertificate {
            view,
            seqno,
            digest,
            signatures: slot.commits.signatures(&digest),
        };
        slot.commit_certificate = Some(certificate.clone());
        slot.phase = SlotPhase::Committed;
        Some(certificate)
    }

    /// Sequence numbers of the slots that are not yet prepared or committed, in ascending order.
    pub(crate) fn uncertified(&self) -> Vec<SeqNo> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.phase < SlotPhase::Committed && slot.digest.is_some())
            .map(|(seqno, _)| *seqno)
            .collect()
    }

    /// The pre-prepare after `last_executed` and the result of executing it, if it is committed.
    pub(crate) fn next_committed(&self) -> Option<(&PrePrepare, &ByzInfo)> {
        let slot = self.slots.get(&self.last_executed.next())?;
        if slot.phase != SlotPhase::Committed {
            return None;
        }
        Some((slot.pre_prepare.as_ref()?, slot.tentative.as_ref()?))
    }

    /// Remove the slot after `last_executed` if it is committed, advancing `last_executed`. Returns the
    /// certificate the slot was committed with.
    pub(crate) fn finalize_next(&mut self) -> Option<CommitCertificate> {
        let next = self.last_executed.next();
        if self.phase(next) != Some(SlotPhase::Committed) {
            return None;
        }

        let slot = self.slots.remove(&next)?;
        self.last_executed = next;
        slot.commit_certificate
    }

    fn slot_mut(&mut self, seqno: SeqNo) -> &mut Slot {
        let (view, num_replicas) = (self.view, self.num_replicas);
        self.slots
            .entry(seqno)
            .or_insert_with(|| Slot::new(view, seqno, num_replicas))
    }
}
