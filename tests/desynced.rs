//! Desynced-clock behavior: posts are refused with a textual error until
//! some source sets the wall clock.

mod common;

use common::{anon_req, ident, new_node, txt_plain};
use meshboard::mesh::PayloadType;

#[test]
fn post_while_desynced_gets_error_reply_and_no_ack() {
    let mut tn = new_node();
    let q = ident(0xBB);
    // read-write login works while desynced; posting does not
    tn.node.handle_frame(anon_req(q, 1_800_000_000, 0, "hello"));
    assert!(tn.node.clock().is_desynced());
    tn.clear_sent();

    tn.node.handle_frame(txt_plain(q, 1_800_000_100, "too early"));

    assert_eq!(tn.node.posts().iter_newest_first().count(), 0);
    assert!(tn.transport().acks().is_empty(), "no ACK for a refused post");

    let replies = tn.transport().sent_to(&q);
    assert_eq!(replies.len(), 1);
    let reply = replies[0];
    assert_eq!(reply.ptype, PayloadType::TxtMsg);
    // server-signed reply: our pubkey prefix then the error text
    assert_eq!(&reply.payload[5..9], &tn.node.identity().pub_key[..4]);
    assert_eq!(&reply.payload[9..], b"Error: Server clock desynced");
}

#[test]
fn posting_resumes_after_admin_sync() {
    let mut tn = new_node();
    let p = ident(0xAA);
    let q = ident(0xBB);
    tn.node.handle_frame(anon_req(q, 1_800_000_000, 0, "hello"));
    tn.node.handle_frame(anon_req(p, 1_800_000_010, 0, "password"));
    assert!(!tn.node.clock().is_desynced());
    tn.clear_sent();

    tn.node.handle_frame(txt_plain(q, 1_800_000_100, "now it works"));
    assert_eq!(tn.node.posts().iter_newest_first().count(), 1);
    assert_eq!(tn.transport().acks().len(), 1);
}

#[test]
fn desynced_boot_queues_operator_notice() {
    let tn = new_node();
    let notice = (0..tn.node.system_msgs().len())
        .filter_map(|i| tn.node.system_msgs().get(i))
        .any(|m| m.text.contains("Clock desynced - read-only until admin login"));
    assert!(notice);
    let boot_tag = format!("boot:{}", tn.node.boot_sequence());
    let tagged = (0..tn.node.system_msgs().len())
        .filter_map(|i| tn.node.system_msgs().get(i))
        .all(|m| m.text.contains(&boot_tag));
    assert!(tagged, "system messages carry the boot sequence");
}

#[test]
fn console_bulletin_refused_while_desynced() {
    let mut tn = new_node();
    assert_eq!(
        tn.node.handle_command(0, "bulletin.info too soon"),
        "ERROR: Clock not synced"
    );
    assert_eq!(tn.node.posts().iter_newest_first().count(), 0);
}
