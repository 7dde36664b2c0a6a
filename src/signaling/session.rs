use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::capture::{ConsumerId, FrameBroadcaster, OverflowPolicy};
use crate::error::{Error, Result};

use super::hub::{HubEvent, HubLink};
use super::messages::{IceCandidate, InboundMessage, OutboundMessage, SessionDescription};
use super::peer::{MediaPeer, PeerFactory, PeerState, ViewerId};
use super::track::VideoTrack;

#[derive(Debug, Clone, Copy)]
pub struct SignalingOptions {
    pub viewer_queue_capacity: usize,
    pub receive_timeout: Duration,
    pub resolution: (u32, u32),
    /// Upper bound `stop` waits for the event task and for each peer to close.
    pub join_timeout: Duration,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            viewer_queue_capacity: 2,
            receive_timeout: Duration::from_secs(1),
            resolution: (858, 480),
            join_timeout: Duration::from_millis(1_500),
        }
    }
}

/// Why a session ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    ExamEnded,
    Failed(String),
}

struct PeerEntry {
    peer: Box<dyn MediaPeer>,
    state: PeerState,
    consumer: ConsumerId,
}

type PeerTable = Arc<Mutex<HashMap<ViewerId, PeerEntry>>>;

/// Peer connections for one exam generation, negotiated over the hub.
pub struct SignalingSession {
    peers: PeerTable,
    broadcaster: Arc<FrameBroadcaster>,
    cancel_token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl SignalingSession {
    /// Opens the taker peer and one peer per proctor, sends their offers and
    /// starts handling hub traffic. Only a taker failure aborts the start;
    /// a proctor that fails to negotiate is closed on its own.
    ///
    /// The returned receiver resolves if the hub ends the session.
    pub async fn start(
        link: HubLink,
        factory: Arc<dyn PeerFactory>,
        broadcaster: Arc<FrameBroadcaster>,
        proctors: &[String],
        options: SignalingOptions,
    ) -> Result<(Self, oneshot::Receiver<SessionOutcome>)> {
        let HubLink { outbound, inbound } = link;
        let mut session = Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            broadcaster,
            cancel_token: None,
            handle: None,
            join_timeout: options.join_timeout,
        };

        if let Err(err) = session
            .open_viewer(ViewerId::Taker, factory.as_ref(), &outbound, &options)
            .await
        {
            session.stop().await;
            return Err(err);
        }

        for proctor in proctors {
            let viewer = ViewerId::Proctor(proctor.clone());
            if let Err(err) = session
                .open_viewer(viewer.clone(), factory.as_ref(), &outbound, &options)
                .await
            {
                log::warn!("could not offer camera to {viewer}: {err}");
            }
        }

        let cancel_token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = tokio::spawn(event_loop(
            inbound,
            outbound,
            Arc::clone(&session.peers),
            Arc::clone(&session.broadcaster),
            cancel_token.clone(),
            outcome_tx,
        ));

        session.cancel_token = Some(cancel_token);
        session.handle = Some(handle);
        log::info!("signaling session started with {} proctor(s)", proctors.len());
        Ok((session, outcome_rx))
    }

    async fn open_viewer(
        &self,
        viewer: ViewerId,
        factory: &dyn PeerFactory,
        outbound: &mpsc::Sender<OutboundMessage>,
        options: &SignalingOptions,
    ) -> Result<()> {
        let consumer = self.broadcaster.attach(
            format!("viewer:{viewer}"),
            options.viewer_queue_capacity,
            OverflowPolicy::DropNewest,
        );
        let consumer_id = consumer.id();
        let track = VideoTrack::new(consumer, options.receive_timeout, options.resolution);

        let peer = match factory.create(&viewer, track) {
            Ok(peer) => peer,
            Err(err) => {
                self.broadcaster.detach(consumer_id);
                return Err(negotiation(&viewer, err));
            }
        };

        let mut entry = PeerEntry {
            peer,
            state: PeerState::Idle,
            consumer: consumer_id,
        };
        let result = offer(&viewer, &mut entry, outbound).await;
        if result.is_err() {
            close_entry(&mut entry, &self.broadcaster).await;
        }
        self.peers.lock().await.insert(viewer, entry);
        result
    }

    pub async fn peer_states(&self) -> Vec<(ViewerId, PeerState)> {
        let peers = self.peers.lock().await;
        let mut states: Vec<_> = peers
            .iter()
            .map(|(viewer, entry)| (viewer.clone(), entry.state))
            .collect();
        states.sort_by_key(|(viewer, _)| viewer.to_string());
        states
    }

    pub async fn peer_state(&self, viewer: &ViewerId) -> Option<PeerState> {
        self.peers.lock().await.get(viewer).map(|entry| entry.state)
    }

    /// Closes every peer, detaches their consumers and drops the hub link.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.join_timeout, handle).await.is_err() {
                log::warn!("signaling event task did not exit within {:?}", self.join_timeout);
                abort.abort();
            }
        }

        let mut peers = self.peers.lock().await;
        if peers.is_empty() {
            return;
        }
        for (viewer, entry) in peers.iter_mut() {
            if tokio::time::timeout(self.join_timeout, close_entry(entry, &self.broadcaster))
                .await
                .is_err()
            {
                log::warn!("peer {viewer} did not close within {:?}", self.join_timeout);
                self.broadcaster.detach(entry.consumer);
            }
        }
        peers.clear();
        log::info!("signaling session stopped");
    }
}

fn negotiation(viewer: &ViewerId, err: Error) -> Error {
    match err {
        Error::Negotiation { .. } | Error::SignalingTransport(_) => err,
        other => Error::Negotiation {
            viewer: viewer.to_string(),
            message: other.to_string(),
        },
    }
}

async fn offer(
    viewer: &ViewerId,
    entry: &mut PeerEntry,
    outbound: &mpsc::Sender<OutboundMessage>,
) -> Result<()> {
    entry.state = PeerState::Offering;
    let offer = entry
        .peer
        .create_offer()
        .await
        .map_err(|err| negotiation(viewer, err))?;
    let description = entry
        .peer
        .set_local_description(&offer)
        .await
        .map_err(|err| negotiation(viewer, err))?;

    let message = match viewer {
        ViewerId::Taker => OutboundMessage::OfferToTaker(description),
        ViewerId::Proctor(proctor) => OutboundMessage::OfferToProctor {
            proctor: proctor.clone(),
            offer: description,
        },
    };
    outbound
        .send(message)
        .await
        .map_err(|_| Error::SignalingTransport("hub link closed".into()))?;

    entry.state = PeerState::Negotiating;
    log::info!("offer sent to {viewer}");
    Ok(())
}

async fn close_entry(entry: &mut PeerEntry, broadcaster: &FrameBroadcaster) {
    if entry.state != PeerState::Closed {
        entry.peer.close().await;
        entry.state = PeerState::Closed;
    }
    broadcaster.detach(entry.consumer);
}

async fn event_loop(
    mut inbound: mpsc::Receiver<HubEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    peers: PeerTable,
    broadcaster: Arc<FrameBroadcaster>,
    cancel_token: CancellationToken,
    outcome_tx: oneshot::Sender<SessionOutcome>,
) {
    let outcome = loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => return,
            event = inbound.recv() => event,
        };

        match event {
            Some(HubEvent::Message(InboundMessage::ExamEnded)) => {
                log::info!("hub ended the exam");
                break SessionOutcome::ExamEnded;
            }
            Some(HubEvent::Message(message)) => {
                handle_message(message, &peers, &broadcaster).await;
            }
            Some(HubEvent::Reconnected) => {
                reoffer(&peers, &outbound, &broadcaster).await;
            }
            Some(HubEvent::Failed(reason)) => {
                log::error!("signaling transport failed: {reason}");
                break SessionOutcome::Failed(reason);
            }
            None => break SessionOutcome::Failed("hub link closed".into()),
        }
    };

    if !cancel_token.is_cancelled() {
        let _ = outcome_tx.send(outcome);
    }
}

async fn handle_message(message: InboundMessage, peers: &PeerTable, broadcaster: &FrameBroadcaster) {
    match message {
        InboundMessage::AnswerFromTaker(answer) => {
            apply_answer(ViewerId::Taker, answer, peers, broadcaster).await;
        }
        InboundMessage::AnswerFromProctor { proctor, answer } => {
            apply_answer(ViewerId::Proctor(proctor), answer, peers, broadcaster).await;
        }
        InboundMessage::IceCandidateFromTaker(candidate) => {
            add_candidate(ViewerId::Taker, candidate, peers).await;
        }
        InboundMessage::IceCandidateFromProctor { proctor, candidate } => {
            add_candidate(ViewerId::Proctor(proctor), candidate, peers).await;
        }
        InboundMessage::ExamEnded => {}
    }
}

async fn apply_answer(
    viewer: ViewerId,
    answer: SessionDescription,
    peers: &PeerTable,
    broadcaster: &FrameBroadcaster,
) {
    let mut peers = peers.lock().await;
    let Some(entry) = peers.get_mut(&viewer) else {
        log::debug!("answer from unknown viewer {viewer}");
        return;
    };
    if entry.state != PeerState::Negotiating {
        log::debug!("ignoring answer from {viewer} in state {:?}", entry.state);
        return;
    }

    match entry.peer.set_remote_description(&answer).await {
        Ok(()) => {
            entry.state = PeerState::Connected;
            log::info!("peer {viewer} connected");
        }
        Err(err) => {
            log::warn!("{}", negotiation(&viewer, err));
            close_entry(entry, broadcaster).await;
        }
    }
}

async fn add_candidate(viewer: ViewerId, candidate: IceCandidate, peers: &PeerTable) {
    let mut peers = peers.lock().await;
    match peers.get_mut(&viewer) {
        Some(entry) if entry.state != PeerState::Closed => {
            if let Err(err) = entry.peer.add_ice_candidate(&candidate).await {
                log::warn!("ice candidate from {viewer} rejected: {err}");
            }
        }
        _ => log::debug!("dropping ice candidate for {viewer}"),
    }
}

async fn reoffer(
    peers: &PeerTable,
    outbound: &mpsc::Sender<OutboundMessage>,
    broadcaster: &FrameBroadcaster,
) {
    let mut peers = peers.lock().await;
    for (viewer, entry) in peers.iter_mut() {
        if matches!(entry.state, PeerState::Connected | PeerState::Closed) {
            continue;
        }
        if let Err(err) = offer(viewer, entry, outbound).await {
            log::warn!("re-offer to {viewer} failed: {err}");
            close_entry(entry, broadcaster).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::hub::HubEndpoint;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Journal {
        events: StdMutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    struct MockPeer {
        viewer: ViewerId,
        journal: Arc<Journal>,
        _track: VideoTrack,
    }

    #[async_trait]
    impl MediaPeer for MockPeer {
        async fn create_offer(&mut self) -> Result<SessionDescription> {
            self.journal.push(format!("offer {}", self.viewer));
            Ok(SessionDescription::offer(format!("v=0 {}", self.viewer)))
        }

        async fn set_local_description(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
            Ok(offer.clone())
        }

        async fn set_remote_description(&mut self, answer: &SessionDescription) -> Result<()> {
            if answer.sdp == "bad" {
                return Err(Error::Negotiation {
                    viewer: self.viewer.to_string(),
                    message: "malformed answer".into(),
                });
            }
            self.journal.push(format!("answer {}", self.viewer));
            Ok(())
        }

        async fn add_ice_candidate(&mut self, _candidate: &IceCandidate) -> Result<()> {
            self.journal.push(format!("ice {}", self.viewer));
            Ok(())
        }

        async fn close(&mut self) {
            self.journal.push(format!("close {}", self.viewer));
        }
    }

    struct MockFactory {
        journal: Arc<Journal>,
        fail_for: Option<ViewerId>,
    }

    impl PeerFactory for MockFactory {
        fn create(&self, viewer: &ViewerId, track: VideoTrack) -> Result<Box<dyn MediaPeer>> {
            if self.fail_for.as_ref() == Some(viewer) {
                return Err(Error::Negotiation {
                    viewer: viewer.to_string(),
                    message: "no codec".into(),
                });
            }
            Ok(Box::new(MockPeer {
                viewer: viewer.clone(),
                journal: Arc::clone(&self.journal),
                _track: track,
            }))
        }
    }

    fn options() -> SignalingOptions {
        SignalingOptions {
            receive_timeout: Duration::from_millis(10),
            join_timeout: Duration::from_millis(500),
            ..SignalingOptions::default()
        }
    }

    async fn start(
        proctors: &[&str],
        fail_for: Option<ViewerId>,
    ) -> (
        Result<(SignalingSession, oneshot::Receiver<SessionOutcome>)>,
        HubEndpoint,
        Arc<FrameBroadcaster>,
        Arc<Journal>,
    ) {
        let journal = Arc::new(Journal::default());
        let factory = Arc::new(MockFactory {
            journal: Arc::clone(&journal),
            fail_for,
        });
        let broadcaster = FrameBroadcaster::new();
        let (link, endpoint) = HubLink::pair();
        let proctors: Vec<String> = proctors.iter().map(|p| p.to_string()).collect();
        let result =
            SignalingSession::start(link, factory, Arc::clone(&broadcaster), &proctors, options()).await;
        (result, endpoint, broadcaster, journal)
    }

    async fn send(endpoint: &HubEndpoint, event: HubEvent) {
        endpoint.inbound.send(event).await.unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn offers_go_out_for_taker_and_each_proctor() {
        let (result, mut endpoint, broadcaster, _) = start(&["p1", "p2"], None).await;
        let (mut session, _outcome) = result.unwrap();

        let mut targets = Vec::new();
        while let Ok(message) = endpoint.outbound.try_recv() {
            targets.push(match message {
                OutboundMessage::OfferToTaker(_) => "taker".to_string(),
                OutboundMessage::OfferToProctor { proctor, .. } => proctor,
            });
        }
        targets.sort();
        assert_eq!(targets, vec!["p1", "p2", "taker"]);
        assert_eq!(broadcaster.consumer_count(), 3);
        assert_eq!(
            session.peer_state(&ViewerId::Taker).await,
            Some(PeerState::Negotiating)
        );

        session.stop().await;
    }

    #[tokio::test]
    async fn answers_connect_their_own_peer_only() {
        let (result, endpoint, _, _) = start(&["p1", "p2"], None).await;
        let (mut session, _outcome) = result.unwrap();

        send(&endpoint, HubEvent::Message(InboundMessage::AnswerFromTaker(SessionDescription::answer("a")))).await;
        send(
            &endpoint,
            HubEvent::Message(InboundMessage::AnswerFromProctor {
                proctor: "p2".into(),
                answer: SessionDescription::answer("a"),
            }),
        )
        .await;
        settle().await;

        assert_eq!(session.peer_state(&ViewerId::Taker).await, Some(PeerState::Connected));
        assert_eq!(
            session.peer_state(&ViewerId::Proctor("p1".into())).await,
            Some(PeerState::Negotiating)
        );
        assert_eq!(
            session.peer_state(&ViewerId::Proctor("p2".into())).await,
            Some(PeerState::Connected)
        );

        session.stop().await;
    }

    #[tokio::test]
    async fn bad_answer_closes_only_that_peer() {
        let (result, endpoint, broadcaster, _) = start(&["p1"], None).await;
        let (mut session, _outcome) = result.unwrap();

        send(
            &endpoint,
            HubEvent::Message(InboundMessage::AnswerFromProctor {
                proctor: "p1".into(),
                answer: SessionDescription::answer("bad"),
            }),
        )
        .await;
        settle().await;

        assert_eq!(
            session.peer_state(&ViewerId::Proctor("p1".into())).await,
            Some(PeerState::Closed)
        );
        assert_eq!(session.peer_state(&ViewerId::Taker).await, Some(PeerState::Negotiating));
        assert_eq!(broadcaster.consumer_count(), 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_everything_and_is_idempotent() {
        let (result, _endpoint, broadcaster, journal) = start(&["p1"], None).await;
        let (mut session, _outcome) = result.unwrap();

        session.stop().await;
        assert_eq!(journal.count("close"), 2);
        assert_eq!(broadcaster.consumer_count(), 0);
        assert!(session.peer_states().await.is_empty());

        session.stop().await;
        assert_eq!(journal.count("close"), 2);
    }

    #[tokio::test]
    async fn exam_ended_is_reported() {
        let (result, endpoint, _, _) = start(&[], None).await;
        let (mut session, outcome) = result.unwrap();

        send(&endpoint, HubEvent::Message(InboundMessage::ExamEnded)).await;
        assert_eq!(outcome.await.unwrap(), SessionOutcome::ExamEnded);

        session.stop().await;
    }

    #[tokio::test]
    async fn exhausted_transport_is_reported_as_failure() {
        let (result, endpoint, _, _) = start(&[], None).await;
        let (mut session, outcome) = result.unwrap();

        send(&endpoint, HubEvent::Failed("gone".into())).await;
        assert_eq!(outcome.await.unwrap(), SessionOutcome::Failed("gone".into()));

        session.stop().await;
    }

    #[tokio::test]
    async fn reconnect_reoffers_unconnected_peers() {
        let (result, mut endpoint, _, journal) = start(&["p1"], None).await;
        let (mut session, _outcome) = result.unwrap();
        while endpoint.outbound.try_recv().is_ok() {}

        send(&endpoint, HubEvent::Message(InboundMessage::AnswerFromTaker(SessionDescription::answer("a")))).await;
        send(&endpoint, HubEvent::Reconnected).await;
        settle().await;

        assert_eq!(journal.count("offer proctor:p1"), 2);
        assert_eq!(journal.count("offer taker"), 1);
        assert!(matches!(
            endpoint.outbound.try_recv(),
            Ok(OutboundMessage::OfferToProctor { .. })
        ));

        session.stop().await;
    }

    #[tokio::test]
    async fn taker_failure_aborts_start_without_leaks() {
        let (result, _endpoint, broadcaster, _) = start(&["p1"], Some(ViewerId::Taker)).await;
        assert!(matches!(result, Err(Error::Negotiation { .. })));
        assert_eq!(broadcaster.consumer_count(), 0);
    }

    #[tokio::test]
    async fn proctor_failure_is_isolated() {
        let (result, _endpoint, broadcaster, _) =
            start(&["p1", "p2"], Some(ViewerId::Proctor("p1".into()))).await;
        let (mut session, _outcome) = result.unwrap();

        assert_eq!(session.peer_state(&ViewerId::Proctor("p1".into())).await, None);
        assert_eq!(
            session.peer_state(&ViewerId::Proctor("p2".into())).await,
            Some(PeerState::Negotiating)
        );
        assert_eq!(broadcaster.consumer_count(), 2);

        session.stop().await;
    }
}
