//! System message delivery: admin-only pushes, the pre-login attempt
//! budget, delivery tracking on ACK, and cleanup once every admin has the
//! message.

mod common;

use std::collections::HashMap;

use common::{anon_req, ident, new_node, SentPacket, TestNode};
use meshboard::logutil::hex_full;
use meshboard::mesh::crypto::{CryptoProvider, StdCrypto};
use meshboard::mesh::{Identity, InboundFrame, PayloadType};

/// System-message pushes carry the reserved timestamp 0.
fn sys_pushes<'a>(tn: &'a TestNode, dest: &Identity) -> Vec<&'a SentPacket> {
    tn.transport()
        .sent_to(dest)
        .into_iter()
        .filter(|pkt| {
            pkt.ptype == PayloadType::TxtMsg
                && pkt.payload.len() >= 9
                && pkt.payload[0..4] == [0, 0, 0, 0]
        })
        .collect()
}

#[test]
fn system_messages_never_go_to_non_admins() {
    let mut tn = new_node();
    let q = ident(0xBB);
    tn.node.handle_frame(anon_req(q, 1_800_000_000, 0, "hello"));
    tn.clear_sent();

    tn.run_ticks(40, 2000);
    assert!(
        sys_pushes(&tn, &q).is_empty(),
        "read-write client must not receive system messages"
    );
}

#[test]
fn prelogin_attempts_are_capped_at_three() {
    let mut tn = new_node();
    // admin known from the ACL but never logged in this boot
    let admin = ident(0xAD);
    let cmd = format!("setperm {} 7", hex_full(&admin.pub_key).to_lowercase());
    assert_eq!(tn.node.handle_command(0, &cmd), "OK");
    assert_eq!(tn.node.system_msgs().len(), 1); // boot desync notice
    tn.clear_sent();

    // plenty of time: every push expires unanswered after 12 s
    tn.run_ticks(80, 2000);
    assert_eq!(
        sys_pushes(&tn, &admin).len(),
        3,
        "pre-login delivery attempts are budgeted"
    );

    // login resets the budget; delivery resumes
    tn.node
        .handle_frame(anon_req(admin, 1_800_000_000, 0, "password"));
    tn.clear_sent();
    tn.run_ticks(40, 2000);
    let per_message: HashMap<Vec<u8>, usize> =
        sys_pushes(&tn, &admin)
            .into_iter()
            .fold(HashMap::new(), |mut acc, pkt| {
                *acc.entry(pkt.payload[9..].to_vec()).or_default() += 1;
                acc
            });
    assert!(!per_message.is_empty(), "attempts resume after login");
    for (text, count) in &per_message {
        assert!(
            *count <= 3,
            "message {:?} pushed {count} times",
            String::from_utf8_lossy(text)
        );
    }
}

#[test]
fn ack_marks_delivered_and_cleanup_reaps() {
    let mut tn = new_node();
    let admin = ident(0xAD);
    tn.node
        .handle_frame(anon_req(admin, 1_800_000_000, 0, "password"));
    tn.clear_sent();

    // deliver and ACK system messages until the admin has seen them all
    let mut guard = 0;
    while tn.node.system_msgs().len() > 0 && guard < 50 {
        tn.tick_after(2000);
        let push = sys_pushes(&tn, &admin).last().cloned().cloned();
        if let Some(push) = push {
            let token = StdCrypto.ack_token(&push.payload, &admin);
            tn.node.handle_frame(InboundFrame::Ack { token });
            tn.clear_sent();
        }
        // cleanup runs on its own 60 s cadence
        tn.tick_after(61_000);
        guard += 1;
    }
    assert_eq!(
        tn.node.system_msgs().len(),
        0,
        "fully delivered messages are reaped"
    );
}

#[test]
fn undelivered_messages_survive_cleanup() {
    let mut tn = new_node();
    let admin = ident(0xAD);
    tn.node
        .handle_frame(anon_req(admin, 1_800_000_000, 0, "password"));
    let before = tn.node.system_msgs().len();
    assert!(before > 0);

    // no ACKs: cleanup must not remove anything
    tn.run_ticks(5, 61_000);
    assert_eq!(tn.node.system_msgs().len(), before);
}

#[test]
fn channel_mode_change_appends_system_message() {
    let mut tn = new_node();
    assert_eq!(
        tn.node.handle_command(0, "set channel.mode private"),
        "OK - Channel mode set to private"
    );
    let notice = (0..tn.node.system_msgs().len())
        .filter_map(|i| tn.node.system_msgs().get(i))
        .any(|m| m.text.contains("Channel mode changed to private"));
    assert!(notice);
    // idempotent switch does not append another notice
    let count = tn.node.system_msgs().len();
    tn.node.handle_command(0, "set channel.mode private");
    assert_eq!(tn.node.system_msgs().len(), count);
}
