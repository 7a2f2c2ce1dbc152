//! Console and CLI-data command surface: permissions, bulletins with rate
//! limiting and channel broadcast, channel mode, and error replies.

mod common;

use common::{anon_req, ident, new_node, txt_cli};
use meshboard::logutil::hex_full;
use meshboard::mesh::PayloadType;
use meshboard::server::PostSeverity;

const TS: u32 = 1_800_000_000;

#[test]
fn setperm_updates_and_get_acl_lists() {
    let mut tn = new_node();
    let other = ident(0x42);
    let cmd = format!("setperm {} 7", hex_full(&other.pub_key).to_lowercase());
    assert_eq!(tn.node.handle_command(0, &cmd), "OK");
    assert!(tn.node.acl().get_by_pubkey(&[0x42]).unwrap().is_admin());

    let listing = tn.node.handle_command(0, "get acl");
    assert!(listing.contains(&hex_full(&other.pub_key)));

    // demote by prefix
    assert_eq!(tn.node.handle_command(0, "setperm 42424242 0"), "OK");
    assert_eq!(tn.node.acl().get_by_pubkey(&[0x42]).unwrap().permissions, 0);
    // permission-0 entries disappear from the listing
    assert!(!tn.node.handle_command(0, "get acl").contains(&hex_full(&other.pub_key)));
}

#[test]
fn setperm_rejects_own_identity_and_bad_input() {
    let mut tn = new_node();
    let own = hex_full(&tn.node.identity().pub_key).to_lowercase();
    assert_eq!(
        tn.node.handle_command(0, &format!("setperm {own} 7")),
        "Err - invalid params"
    );
    assert_eq!(tn.node.handle_command(0, "setperm zzzz 7"), "Err - bad pubkey");
    assert_eq!(tn.node.handle_command(0, "setperm aabb"), "Err - bad params");
    assert_eq!(
        tn.node.handle_command(0, "setperm aabbcc 8f"),
        "Err - bad params"
    );
    // unknown short prefix matches nothing
    assert_eq!(
        tn.node.handle_command(0, "setperm deadbeef 7"),
        "Err - invalid params"
    );
}

#[test]
fn console_bulletin_posts_with_severity_prefix() {
    let mut tn = new_node();
    tn.node.handle_command(0, "time 1800000000");
    assert_eq!(tn.node.handle_command(0, "bulletin.info road closed"), "");

    let post = tn.node.posts().iter_newest_first().next().expect("post");
    assert_eq!(post.text, "BLTN-INFO: road closed");
    assert!(post.author.matches(tn.node.identity()));
    assert_eq!(PostSeverity::Info.prefix().len(), 11);
}

#[test]
fn bulletin_rate_limit_is_ten_seconds() {
    let mut tn = new_node();
    tn.node.handle_command(0, "time 1800000000");
    tn.time.advance_ms(5);
    assert_eq!(tn.node.handle_command(0, "bulletin.info one"), "");
    let second = tn.node.handle_command(0, "bulletin.info two");
    assert!(second.starts_with("ERROR: Rate limit hit"), "{second}");

    tn.time.advance_secs(11);
    assert_eq!(tn.node.handle_command(0, "bulletin.info two"), "");
    assert_eq!(tn.node.posts().iter_newest_first().count(), 2);
}

#[test]
fn warning_bulletin_broadcasts_on_channel() {
    let mut tn = new_node();
    tn.node.handle_command(0, "time 1800000000");
    tn.clear_sent();
    tn.node.handle_command(0, "bulletin.warning storm inbound");

    let broadcasts: Vec<_> = tn
        .transport()
        .sent
        .iter()
        .filter(|pkt| pkt.ptype == PayloadType::GrpTxt)
        .collect();
    assert_eq!(broadcasts.len(), 1);
    let text = String::from_utf8_lossy(&broadcasts[0].payload);
    assert!(text.contains("BLTN-WARN: storm inbound"));
    assert!(text.contains("Bulletin Server: "), "sender name prefix: {text}");

    // info bulletins stay off the channel
    tn.time.advance_secs(11);
    tn.clear_sent();
    tn.node.handle_command(0, "bulletin.info calm again");
    assert!(tn
        .transport()
        .sent
        .iter()
        .all(|pkt| pkt.ptype != PayloadType::GrpTxt));
}

#[test]
fn bulletin_errors_over_length_and_severity() {
    let mut tn = new_node();
    tn.node.handle_command(0, "time 1800000000");
    let long = "x".repeat(141);
    assert_eq!(
        tn.node.handle_command(0, &format!("bulletin.info {long}")),
        "ERROR: Max 140 chars"
    );
    assert!(tn
        .node
        .handle_command(0, "bulletin.urgent nope")
        .starts_with("ERROR: Invalid severity"));
    assert_eq!(
        tn.node.handle_command(0, "bulletin.info "),
        "ERROR: Invalid severity. Use bulletin.info|bulletin.warning|bulletin.critical"
    );
}

#[test]
fn remote_admin_runs_commands_over_cli_data() {
    let mut tn = new_node();
    let p = ident(0xAA);
    tn.node.handle_frame(anon_req(p, TS, 0, "password"));
    tn.clear_sent();

    tn.node
        .handle_frame(txt_cli(p, TS + 10, "bulletin.info from afar"));

    // CLI data gets a CLI reply and no ACK
    assert!(tn.transport().acks().is_empty());
    let replies = tn.transport().sent_to(&p);
    assert_eq!(replies.len(), 1);
    let reply = replies[0];
    assert_eq!(reply.ptype, PayloadType::TxtMsg);
    assert_eq!(reply.payload[4] >> 2, 1); // CLI_DATA
    assert_eq!(&reply.payload[5..], b"OK - INFO bulletin posted");
    assert_eq!(tn.node.posts().iter_newest_first().count(), 1);
}

#[test]
fn non_admin_cli_data_is_silently_ignored() {
    let mut tn = new_node();
    let q = ident(0xBB);
    tn.node.handle_frame(anon_req(q, TS, 0, "hello"));
    tn.clear_sent();

    tn.node.handle_frame(txt_cli(q, TS + 10, "get acl"));
    assert!(tn.transport().sent.is_empty());
}

#[test]
fn channel_key_follows_mode() {
    let mut tn = new_node();
    let public_key_hex = tn.node.handle_command(0, "get channel.key");
    assert_eq!(
        public_key_hex,
        hex_full(&tn.node.identity().pub_key[..16])
    );
    assert_eq!(tn.node.handle_command(0, "get channel.mode"), "public");

    tn.node.handle_command(0, "set channel.mode private");
    assert_eq!(tn.node.handle_command(0, "get channel.mode"), "private");
    let private_key_hex = tn.node.handle_command(0, "get channel.key");
    assert_eq!(private_key_hex.len(), 32);
    assert_ne!(private_key_hex, public_key_hex);
}

#[test]
fn unknown_and_out_of_range_commands_error() {
    let mut tn = new_node();
    assert_eq!(tn.node.handle_command(0, "frobnicate"), "Err - unknown command");
    assert_eq!(
        tn.node.handle_command(0, "set nettime.maxwait 99"),
        "Error: Range 5-60 minutes"
    );
    assert_eq!(
        tn.node.handle_command(0, "set nettime.maxwait 4"),
        "Error: Range 5-60 minutes"
    );
    assert_eq!(
        tn.node.handle_command(0, "set channel.mode sideways"),
        "Error: Use 'public' or 'private'"
    );
}

#[test]
fn companion_prefix_is_reflected() {
    let mut tn = new_node();
    let reply = tn.node.handle_command(TS, "01|get nettime.enable");
    assert_eq!(reply, "01|off");
}
