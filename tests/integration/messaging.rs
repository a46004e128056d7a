use crate::*;

use serde_json::{json, Value};
use tally_core::wire::CONTENT_HEADER_LEN;

fn jsn(body: Value) -> String {
    format!("jsn:{body}")
}

fn parse_json_reply(reply: &str) -> Value {
    serde_json::from_str(reply.strip_prefix("jsn:").expect("jsn: reply")).unwrap()
}

/// "hello" split into 3-byte chunks comes back unchanged.
#[tokio::test]
async fn test_text_echo_through_small_chunks() {
    let server = spawn_server(test_config()).await;
    let settings = ClientSettings {
        mtu: CONTENT_HEADER_LEN + 3,
        ..client_settings()
    };
    let mut c = Client::with_settings(server.local_addr(), settings)
        .await
        .unwrap();

    assert_eq!(c.request("txt:hello").await.unwrap(), "hello");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_large_message_round_trip() {
    let server = spawn_server(test_config()).await;
    let mut c = client(server.local_addr()).await;

    let text: String = (0..6000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let reply = c.request(&format!("txt:{text}")).await.unwrap();
    assert_eq!(reply, text);
    server.shutdown().await.unwrap();
}

/// The MTU sizes outbound chunks only; a peer may send larger ones.
#[tokio::test]
async fn test_inbound_chunks_larger_than_server_mtu() {
    let mut config = test_config();
    config.network.mtu = CONTENT_HEADER_LEN + 8;
    let server = spawn_server(config).await;
    let mut c = client(server.local_addr()).await;

    let text = "x".repeat(100);
    assert_eq!(c.request(&format!("txt:{text}")).await.unwrap(), text);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_add_value_to_unknown_series_is_not_found() {
    let server = spawn_server(test_config()).await;
    let mut c = client(server.local_addr()).await;

    let reply = c
        .request(&jsn(json!({"type": "add_currency_value", "currency": "usd", "value": 1.0})))
        .await
        .unwrap();
    assert!(reply.starts_with("err:"), "{reply}");
    assert!(reply.contains("not found"), "{reply}");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_series_lifecycle() {
    let server = spawn_server(test_config()).await;
    let mut c = client(server.local_addr()).await;

    let add = jsn(json!({"type": "add_currency", "currency": "eur"}));
    assert!(c.request(&add).await.unwrap().starts_with("txt:"));
    assert!(c.request(&add).await.unwrap().contains("already exists"));

    for value in [1.0, 1.5] {
        let reply = c
            .request(&jsn(json!({"type": "add_currency_value", "currency": "eur", "value": value})))
            .await
            .unwrap();
        assert!(reply.starts_with("txt:"), "{reply}");
    }

    let hist = parse_json_reply(
        &c.request(&jsn(json!({"type": "get_currency_history", "currency": "eur"})))
            .await
            .unwrap(),
    );
    assert_eq!(hist["history"].as_array().unwrap().len(), 2);
    assert_eq!(hist["history"][1]["inc_abs"], 0.5);

    let all = parse_json_reply(&c.request("cmd:get_all_currencies").await.unwrap());
    assert_eq!(all["currencies"][0]["currency"], "eur");
    assert_eq!(all["currencies"][0]["value"], 1.5);

    let del = jsn(json!({"type": "del_currency", "currency": "eur"}));
    assert!(c.request(&del).await.unwrap().starts_with("txt:"));
    assert!(c.request(&del).await.unwrap().starts_with("err:"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_requests_get_error_replies() {
    let server = spawn_server(test_config()).await;
    let mut c = client(server.local_addr()).await;

    assert_eq!(
        c.request("zzz:what").await.unwrap(),
        "err:Unknown message type"
    );
    assert_eq!(c.request("cmd:reboot").await.unwrap(), "err:Unknown command");
    assert!(c
        .request("jsn:{\"type\":")
        .await
        .unwrap()
        .starts_with("err:Malformed request"));

    // The session keeps working after errors.
    assert_eq!(c.request("txt:still here").await.unwrap(), "still here");
    server.shutdown().await.unwrap();
}
