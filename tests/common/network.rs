use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pbft_ledger::{
    networking::{Message, Network},
    types::{basic::PrincipalId, principals::PrincipalInfo},
};

/// A mock network stub which passes messages between replicas using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: PrincipalId,
    all_peers: HashMap<PrincipalId, Sender<(PrincipalId, Message)>>,
    inbox: Arc<Mutex<Receiver<(PrincipalId, Message)>>>,
}

impl NetworkStub {
    /// Put `message` in the inbox of `to` as if `from` had sent it. Used to play a faulty peer.
    pub(crate) fn deliver_as(&self, from: PrincipalId, to: PrincipalId, message: Message) {
        if let Some(peer) = self.all_peers.get(&to) {
            let _ = peer.send((from, message));
        }
    }
}

impl Network for NetworkStub {
    fn add_principal(&mut self, _: &PrincipalInfo) {}

    fn broadcast(&mut self, message: Message) {
        for (peer, sender) in &self.all_peers {
            if *peer != self.me {
                let _ = sender.send((self.me, message.clone()));
            }
        }
    }

    fn send(&mut self, peer: PrincipalId, message: Message) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.me, message));
        }
    }

    fn recv(&mut self) -> Option<(PrincipalId, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = PrincipalId>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(PrincipalId, Receiver<(PrincipalId, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
