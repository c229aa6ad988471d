//! End-to-end engine tests: full sessions wired together through an
//! in-memory transport, driven by a virtual clock.
//!
//! Run with: cargo test --test engine_test -- --nocapture

use huddle::group::manager::{GroupTransport, SendMessageError, SessionConfig, TopicSetError};
use huddle::group::types::*;
use huddle::{EventSink, GroupEvent, GroupSession};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

// =============================================================================
// IN-MEMORY NETWORK
// =============================================================================

#[derive(Default)]
struct Net {
    /// (dest, source, packet)
    udp: RefCell<VecDeque<(IpPort, IpPort, Vec<u8>)>>,
    /// (dest node addr, source, packet)
    onion_requests: RefCell<VecDeque<(IpPort, IpPort, Vec<u8>)>>,
    /// (dest, packet)
    onion_responses: RefCell<VecDeque<(IpPort, Vec<u8>)>>,
}

struct TestTransport {
    addr: IpPort,
    net: Rc<Net>,
    friend_out: Rc<RefCell<Vec<(FriendId, Vec<u8>)>>>,
}

impl GroupTransport for TestTransport {
    fn send_udp(&mut self, dest: IpPort, packet: &[u8]) -> bool {
        self.net.udp.borrow_mut().push_back((dest, self.addr, packet.to_vec()));
        true
    }

    fn send_tcp_relay(&mut self, _relay: &TcpRelay, _dest_enc_pk: &[u8; 32], _packet: &[u8]) -> bool {
        // No relay fabric in these tests; direct paths always work.
        false
    }

    fn send_onion(&mut self, dest: &NodeInfo, packet: &[u8]) -> bool {
        self.net
            .onion_requests
            .borrow_mut()
            .push_back((dest.ip_port, self.addr, packet.to_vec()));
        true
    }

    fn send_onion_response(&mut self, dest: IpPort, packet: &[u8]) -> bool {
        self.net.onion_responses.borrow_mut().push_back((dest, packet.to_vec()));
        true
    }

    fn send_friend(&mut self, friend_id: FriendId, data: &[u8]) -> bool {
        self.friend_out.borrow_mut().push((friend_id, data.to_vec()));
        true
    }
}

#[derive(Default, Clone)]
struct RecordingSink {
    events: Rc<RefCell<Vec<(GroupId, GroupEvent)>>>,
}

impl EventSink for RecordingSink {
    fn on_event(&mut self, group_id: GroupId, event: GroupEvent) {
        self.events.borrow_mut().push((group_id, event));
    }
}

struct TestNode {
    session: GroupSession,
    addr: IpPort,
    events: Rc<RefCell<Vec<(GroupId, GroupEvent)>>>,
    friend_out: Rc<RefCell<Vec<(FriendId, Vec<u8>)>>>,
}

impl TestNode {
    fn new(host: u8, net: &Rc<Net>, bootstrap: Vec<NodeInfo>) -> Self {
        let addr = IpPort::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, host)), 33445);
        let friend_out = Rc::new(RefCell::new(Vec::new()));
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let config = SessionConfig {
            self_ip_port: Some(addr),
            self_tcp_relays: Vec::new(),
            bootstrap_nodes: bootstrap,
        };
        let transport = TestTransport { addr, net: net.clone(), friend_out: friend_out.clone() };
        Self {
            session: GroupSession::new(config, Box::new(transport), Box::new(sink)),
            addr,
            events,
            friend_out,
        }
    }

    fn last_friend_message(&self) -> (FriendId, Vec<u8>) {
        self.friend_out.borrow().last().cloned().expect("no friend message sent")
    }

    /// First PeerJoin in the given group.
    fn joined_peer_id(&self, group_id: GroupId) -> PeerId {
        self.events
            .borrow()
            .iter()
            .find_map(|(gid, event)| match event {
                GroupEvent::PeerJoin { peer_id } if *gid == group_id => Some(*peer_id),
                _ => None,
            })
            .expect("no peer joined")
    }

    fn messages(&self, group_id: GroupId) -> Vec<(PeerId, MessageKind, Vec<u8>)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|(gid, event)| match event {
                GroupEvent::Message { peer_id, kind, message } if *gid == group_id => {
                    Some((*peer_id, *kind, message.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn count_events<F: Fn(&GroupEvent) -> bool>(&self, group_id: GroupId, pred: F) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|(gid, event)| *gid == group_id && pred(event))
            .count()
    }
}

/// Delivers queued traffic until the network is quiet.
fn pump_net(net: &Rc<Net>, nodes: &mut [&mut TestNode], now_ms: u64) {
    loop {
        let item = net.udp.borrow_mut().pop_front();
        if let Some((dest, source, packet)) = item {
            for node in nodes.iter_mut() {
                if node.addr == dest {
                    node.session.handle_udp_packet(source, &packet, now_ms);
                }
            }
            continue;
        }
        let item = net.onion_requests.borrow_mut().pop_front();
        if let Some((dest, source, packet)) = item {
            for node in nodes.iter_mut() {
                if node.addr == dest {
                    node.session.handle_announce_request(source, &packet, now_ms);
                }
            }
            continue;
        }
        let item = net.onion_responses.borrow_mut().pop_front();
        if let Some((dest, packet)) = item {
            for node in nodes.iter_mut() {
                if node.addr == dest {
                    node.session.handle_onion_response(&packet, now_ms);
                }
            }
            continue;
        }
        break;
    }
}

/// Builds a two-peer private group through the friend-invite flow.
/// Returns the nodes and their group ids; the handshake is complete and
/// both sides have fired SelfJoin.
fn two_peer_group(net: &Rc<Net>) -> (TestNode, TestNode, GroupId, GroupId) {
    let mut a = TestNode::new(1, net, Vec::new());
    let mut b = TestNode::new(2, net, Vec::new());

    let group_a = a
        .session
        .create_group(PrivacyState::Private, b"Utah Data Center", b"George")
        .unwrap();

    a.session.invite_friend(group_a, 0).unwrap();
    let (_, invite) = a.last_friend_message();

    let group_b = b.session.accept_invite(0, &invite, b"Victor", b"").unwrap();
    let (_, accept) = b.last_friend_message();

    a.session.handle_friend_message(0, &accept, 0);
    let (_, confirmation) = a.last_friend_message();

    b.session.handle_friend_message(0, &confirmation, 0);
    pump_net(net, &mut [&mut a, &mut b], 10);

    assert_eq!(a.session.is_connected(group_a), Some(true));
    assert_eq!(b.session.is_connected(group_b), Some(true));
    assert_eq!(a.count_events(group_a, |e| matches!(e, GroupEvent::SelfJoin)), 1);
    assert_eq!(b.count_events(group_b, |e| matches!(e, GroupEvent::SelfJoin)), 1);

    (a, b, group_a, group_b)
}

/// The 487-byte condemned-man passage.
fn long_message() -> Vec<u8> {
    let mut message = b"Where is it I've read that someone condemned to death says or thinks, an hour \
before his death, that if he had to live on some high rock, on such a narrow ledge that he'd only \
room to stand, and the ocean, everlasting darkness, everlasting solitude, everlasting tempest \
around him, if he had to remain standing on a square yard of space all his life, a thousand years, \
eternity, it were better to live so than to die at once."
        .to_vec();
    message.resize(487, b'.');
    message
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_two_peer_message_round_trip() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    // B sees A join, with A's nickname resolving through peer info.
    let peer_a_at_b = b.joined_peer_id(group_b);
    assert_eq!(b.session.peer_nick(group_b, peer_a_at_b), Some(b"George".to_vec()));
    assert_eq!(a.session.group_name(group_a), Some(b"Utah Data Center".to_vec()));
    // The joiner adopted the founder-signed group name.
    assert_eq!(b.session.group_name(group_b), Some(b"Utah Data Center".to_vec()));

    let message = long_message();
    assert_eq!(message.len(), 487);
    b.session.send_message(group_b, MessageKind::Normal, &message, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    let received = a.messages(group_a);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, MessageKind::Normal);
    assert_eq!(received[0].2, message);
}

#[test]
fn test_private_action_message() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, _group_b) = two_peer_group(&net);

    let peer_b_at_a = a.joined_peer_id(group_a);
    a.session
        .send_private_message(group_a, peer_b_at_a, MessageKind::Action, b"Don't spill yer beans", 100)
        .unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    let private: Vec<_> = b
        .events
        .borrow()
        .iter()
        .filter_map(|(_, event)| match event {
            GroupEvent::PrivateMessage { kind, message, .. } => Some((*kind, message.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(private, vec![(MessageKind::Action, b"Don't spill yer beans".to_vec())]);
}

#[test]
fn test_custom_packet_lossless_and_lossy() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    let payload = b"Why'd ya spill yer beans?";
    assert_eq!(payload.len(), 25);
    a.session.send_custom_packet(group_a, true, payload, 100).unwrap();
    a.session.send_custom_packet(group_a, false, payload, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    let received: Vec<Vec<u8>> = b
        .events
        .borrow()
        .iter()
        .filter_map(|(gid, event)| match event {
            GroupEvent::CustomPacket { data, .. } if *gid == group_b => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|data| data == payload));
}

#[test]
fn test_lossless_ordering_under_spam() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    for n in 0..=1000u32 {
        let body = n.to_string().into_bytes();
        a.session.send_message(group_a, MessageKind::Normal, &body, 200).unwrap();
    }
    pump_net(&net, &mut [&mut a, &mut b], 200);

    let numbers: Vec<u32> = b
        .messages(group_b)
        .iter()
        .map(|(_, _, message)| String::from_utf8(message.clone()).unwrap().parse().unwrap())
        .collect();
    assert_eq!(numbers.len(), 1001);
    assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(*numbers.last().unwrap(), 1000);
}

#[test]
fn test_lossless_ordering_survives_reordering() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    for n in 0..40u32 {
        let body = format!("msg {n}").into_bytes();
        a.session.send_message(group_a, MessageKind::Normal, &body, 300).unwrap();
    }
    // Deliver everything backwards; the receive queue must reassemble.
    net.udp.borrow_mut().make_contiguous().reverse();
    pump_net(&net, &mut [&mut a, &mut b], 300);

    let received = b.messages(group_b);
    assert_eq!(received.len(), 40);
    for (n, (_, _, message)) in received.iter().enumerate() {
        assert_eq!(message, &format!("msg {n}").into_bytes());
    }
}

#[test]
fn test_ignore_semantics() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    let peer_b_at_a = a.joined_peer_id(group_a);
    a.session.toggle_ignore(group_a, peer_b_at_a, true).unwrap();

    b.session.send_message(group_b, MessageKind::Normal, b"Am I bothering you?", 400).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 400);
    assert!(a.messages(group_a).is_empty());

    a.session.toggle_ignore(group_a, peer_b_at_a, false).unwrap();
    b.session.send_message(group_b, MessageKind::Normal, b"How about now?", 500).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 500);

    let received = a.messages(group_a);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].2, b"How about now?".to_vec());

    // Ignoring never silences state traffic: a nick change still lands.
    a.session.toggle_ignore(group_a, peer_b_at_a, true).unwrap();
    b.session.set_self_nick(group_b, b"Viktor", 600).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 600);
    assert_eq!(a.session.peer_nick(group_a, peer_b_at_a), Some(b"Viktor".to_vec()));
}

#[test]
fn test_founder_password_change() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    a.session.founder_set_password(group_a, b"hunter2", 700).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 700);

    assert_eq!(b.session.password(group_b), Some(b"hunter2".to_vec()));
    assert_eq!(
        b.count_events(group_b, |e| matches!(e, GroupEvent::PasswordChange { password } if password == b"hunter2")),
        1
    );

    // A third peer joining with the wrong password is turned away.
    let mut c = TestNode::new(3, &net, Vec::new());
    a.session.invite_friend(group_a, 1).unwrap();
    let (_, invite) = a.last_friend_message();
    let group_c = c.session.accept_invite(1, &invite, b"Carol", b"letmein").unwrap();
    let (_, accept) = c.last_friend_message();
    a.session.handle_friend_message(1, &accept, 800);
    let (_, confirmation) = a.last_friend_message();
    c.session.handle_friend_message(1, &confirmation, 800);
    pump_net(&net, &mut [&mut a, &mut b, &mut c], 800);

    assert_eq!(
        c.count_events(group_c, |e| matches!(
            e,
            GroupEvent::JoinFail { fail_type: JoinFail::InvalidPassword }
        )),
        1
    );

    // The right password gets in.
    let mut d = TestNode::new(4, &net, Vec::new());
    a.session.invite_friend(group_a, 2).unwrap();
    let (_, invite) = a.last_friend_message();
    let group_d = d.session.accept_invite(2, &invite, b"Daniel", b"hunter2").unwrap();
    let (_, accept) = d.last_friend_message();
    a.session.handle_friend_message(2, &accept, 900);
    let (_, confirmation) = a.last_friend_message();
    d.session.handle_friend_message(2, &confirmation, 900);
    pump_net(&net, &mut [&mut a, &mut b, &mut c, &mut d], 900);

    assert_eq!(d.session.is_connected(group_d), Some(true));
    assert_eq!(a.session.peer_count(group_a), Some(2));
}

#[test]
fn test_confirmed_peer_timeout() {
    let net = Rc::new(Net::default());
    let (mut a, _b, group_a, _group_b) = two_peer_group(&net);

    // B goes silent; its traffic is simply never delivered again.
    let expiry = 10 + CONFIRMED_PEER_TIMEOUT_MS + 1_000;
    a.session.tick(expiry);
    a.session.tick(expiry + PING_INTERVAL_MS);

    let timeouts = a.count_events(group_a, |e| {
        matches!(e, GroupEvent::PeerExit { exit_type: ExitType::Timeout, .. })
    });
    assert_eq!(timeouts, 1);
    assert_eq!(a.session.peer_count(group_a), Some(0));
}

#[test]
fn test_shared_state_version_monotonic() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    a.session.founder_set_peer_limit(group_a, 64, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);
    assert_eq!(b.session.peer_limit(group_b), Some(64));

    a.session.founder_set_topic_lock(group_a, TopicLock::Disabled, 200).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 200);
    assert_eq!(b.session.topic_lock(group_b), Some(TopicLock::Disabled));

    a.session.founder_set_peer_limit(group_a, 65, 300).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 300);
    assert_eq!(b.session.peer_limit(group_b), Some(65));
    // One change event per adopted limit: the initial adoption at join,
    // then 64, then 65.
    assert_eq!(
        b.count_events(group_b, |e| matches!(e, GroupEvent::PeerLimitChange { .. })),
        3
    );
}

#[test]
fn test_topic_and_topic_lock() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);

    // Topic lock starts enabled: the founder may set, a user may not.
    a.session.set_topic(group_a, b"talks at eleven", 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);
    assert_eq!(b.session.topic(group_b), Some(b"talks at eleven".to_vec()));
    assert_eq!(
        b.session.set_topic(group_b, b"mutiny", 150),
        Err(TopicSetError::Permissions)
    );

    // With the lock disabled a user can set the topic, and the founder
    // observes the change.
    a.session.founder_set_topic_lock(group_a, TopicLock::Disabled, 200).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 200);
    b.session.set_topic(group_b, b"new direction", 300).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 300);
    assert_eq!(a.session.topic(group_a), Some(b"new direction".to_vec()));
    assert!(a.count_events(group_a, |e| matches!(e, GroupEvent::TopicChange { .. })) >= 1);
}

#[test]
fn test_observer_demotion_and_restore() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);
    let peer_b_at_a = a.joined_peer_id(group_a);

    a.session.set_peer_role(group_a, peer_b_at_a, Role::Observer, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    assert_eq!(a.session.peer_role(group_a, peer_b_at_a), Some(Role::Observer));
    assert_eq!(b.session.self_role(group_b), Some(Role::Observer));
    assert_eq!(
        b.session.send_message(group_b, MessageKind::Normal, b"quiet?", 150),
        Err(SendMessageError::Permissions)
    );

    a.session.set_peer_role(group_a, peer_b_at_a, Role::User, 200).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 200);
    assert_eq!(b.session.self_role(group_b), Some(Role::User));
    b.session.send_message(group_b, MessageKind::Normal, b"free again", 250).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 250);
    assert_eq!(a.messages(group_a).len(), 1);
}

#[test]
fn test_moderator_promotion() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);
    let peer_b_at_a = a.joined_peer_id(group_a);

    a.session.set_peer_role(group_a, peer_b_at_a, Role::Moderator, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    assert_eq!(b.session.self_role(group_b), Some(Role::Moderator));
    assert_eq!(
        b.count_events(group_b, |e| matches!(
            e,
            GroupEvent::Moderation { event: ModEvent::Mod, .. }
        )),
        1
    );

    // A moderator may set a locked topic.
    b.session.set_topic(group_b, b"mod topic", 200).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 200);
    assert_eq!(a.session.topic(group_a), Some(b"mod topic".to_vec()));
}

#[test]
fn test_kick_peer() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);
    let peer_b_at_a = a.joined_peer_id(group_a);

    a.session.kick_peer(group_a, peer_b_at_a, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    // The kicker removes the peer without a peer_exit of its own.
    assert_eq!(a.session.peer_count(group_a), Some(0));
    assert_eq!(
        a.count_events(group_a, |e| matches!(e, GroupEvent::PeerExit { .. })),
        0
    );

    // The target learns it was kicked and winds down.
    assert_eq!(
        b.count_events(group_b, |e| matches!(
            e,
            GroupEvent::Moderation { peer_id: None, event: ModEvent::Kick }
        )),
        1
    );
    assert_eq!(b.session.is_connected(group_b), Some(false));
}

#[test]
fn test_peer_exit_broadcast() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);
    let peer_b_at_a = a.joined_peer_id(group_a);

    b.session.leave_group(group_b, b"so long and thanks").unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    let exits: Vec<(PeerId, Vec<u8>)> = a
        .events
        .borrow()
        .iter()
        .filter_map(|(gid, event)| match event {
            GroupEvent::PeerExit { peer_id, exit_type: ExitType::Quit, part_message, .. }
                if *gid == group_a =>
            {
                Some((*peer_id, part_message.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(exits, vec![(peer_b_at_a, b"so long and thanks".to_vec())]);
}

#[test]
fn test_announce_rendezvous() {
    let net = Rc::new(Net::default());

    // R is a plain node whose announce responder stores records.
    let mut r = TestNode::new(9, &net, Vec::new());
    let r_info = NodeInfo { public_key: r.session.announce_public_key(), ip_port: r.addr };

    let mut a = TestNode::new(1, &net, vec![r_info]);
    let group_a = a
        .session
        .create_group(PrivacyState::Public, b"agora", b"alice")
        .unwrap();
    let chat_id = a.session.chat_id(group_a).unwrap();

    // Round 1 earns a ping id, round 2 stores the announce.
    a.session.tick(ANNOUNCE_SEARCH_INTERVAL_MS);
    pump_net(&net, &mut [&mut r, &mut a], ANNOUNCE_SEARCH_INTERVAL_MS);
    a.session.tick(ANNOUNCE_SEARCH_INTERVAL_MS * 2);
    pump_net(&net, &mut [&mut r, &mut a], ANNOUNCE_SEARCH_INTERVAL_MS * 2);

    // B looks the chat id up and finds A without ever contacting it first.
    let mut b = TestNode::new(2, &net, vec![r_info]);
    let group_b = b.session.join_group(chat_id, b"bob", b"").unwrap();
    let t_join = ANNOUNCE_SEARCH_INTERVAL_MS * 3;
    b.session.tick(t_join);
    pump_net(&net, &mut [&mut r, &mut a, &mut b], t_join);

    assert_eq!(a.session.is_connected(group_a), Some(true));
    assert_eq!(b.session.is_connected(group_b), Some(true));
    assert_eq!(b.count_events(group_b, |e| matches!(e, GroupEvent::SelfJoin)), 1);

    // Messages flow over the discovered connection.
    b.session.send_message(group_b, MessageKind::Normal, b"found you", t_join + 100).unwrap();
    pump_net(&net, &mut [&mut r, &mut a, &mut b], t_join + 100);
    assert_eq!(a.messages(group_a).len(), 1);
}

#[test]
fn test_nick_and_status_broadcasts() {
    let net = Rc::new(Net::default());
    let (mut a, mut b, group_a, group_b) = two_peer_group(&net);
    let peer_b_at_a = a.joined_peer_id(group_a);

    b.session.set_self_nick(group_b, b"Viktor", 100).unwrap();
    b.session.set_self_status(group_b, PeerStatus::Busy, 100).unwrap();
    pump_net(&net, &mut [&mut a, &mut b], 100);

    assert_eq!(a.session.peer_nick(group_a, peer_b_at_a), Some(b"Viktor".to_vec()));
    assert_eq!(a.session.peer_status(group_a, peer_b_at_a), Some(PeerStatus::Busy));
    assert_eq!(
        a.count_events(group_a, |e| matches!(
            e,
            GroupEvent::NickChange { nick, .. } if nick == b"Viktor"
        )),
        1
    );
    assert_eq!(
        a.count_events(group_a, |e| matches!(
            e,
            GroupEvent::StatusChange { status: PeerStatus::Busy, .. }
        )),
        1
    );
}
