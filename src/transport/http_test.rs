use serde_json::json;

use super::*;
use crate::test_support::TestServer;

fn request(kind: ProcedureKind, procedure: &str, input: Value) -> Request {
    Request { id: RequestId(1), kind, procedure: procedure.to_owned(), input }
}

#[tokio::test]
async fn query_sends_input_as_query_parameter() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "getUser", json!({ "id": 1 }))).await;

    assert_eq!(reply, Ok(Ok(json!({ "id": 1, "name": "Ada" }))));
}

#[tokio::test]
async fn mutation_sends_json_body() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Mutation, "createUser", json!({ "name": "Grace" }))).await;

    assert_eq!(reply, Ok(Ok(json!({ "id": 7, "name": "Grace" }))));
}

#[tokio::test]
async fn error_body_becomes_remote_error() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "nope", Value::Null)).await;

    assert_eq!(reply, Ok(Err(RemoteError::new(404, "unknown procedure `nope`"))));
}

#[tokio::test]
async fn unparsable_error_body_falls_back_to_http_status() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "plain", Value::Null)).await;

    assert_eq!(reply, Ok(Err(RemoteError::new(418, "short and stout"))));
}

#[tokio::test]
async fn trailing_slash_in_endpoint_is_ignored() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&format!("{}/", server.http_endpoint()), None).expect("transport");

    assert_eq!(transport.endpoint(), server.http_endpoint());
    let reply = transport.send_request(request(ProcedureKind::Query, "getUser", json!({ "id": 1 }))).await;
    assert!(matches!(reply, Ok(Ok(_))));
}

#[tokio::test]
async fn client_timeout_maps_to_timeout() {
    let server = TestServer::start().await;
    let transport =
        HttpTransport::new(&server.http_endpoint(), Some(Duration::from_millis(50))).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "slow", Value::Null)).await;

    assert_eq!(reply, Err(TransportError::Timeout));
}

#[tokio::test]
async fn refused_connection_is_disconnected() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let transport = HttpTransport::new(&format!("http://{addr}/rpc"), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "getUser", Value::Null)).await;

    assert_eq!(reply, Err(TransportError::Disconnected));
}

#[tokio::test]
async fn subscriptions_are_unsupported() {
    let transport = HttpTransport::new("http://127.0.0.1:9/rpc", None).expect("transport");

    let opened = transport.open_stream(request(ProcedureKind::Subscription, "counter", Value::Null)).await;
    assert!(matches!(opened, Err(TransportError::Unknown(_))));

    let sent = transport.send_request(request(ProcedureKind::Subscription, "counter", Value::Null)).await;
    assert!(matches!(sent, Err(TransportError::Unknown(_))));
}

#[tokio::test]
async fn closed_transport_rejects_calls() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    transport.close().await;

    let reply = transport.send_request(request(ProcedureKind::Query, "getUser", json!({ "id": 1 }))).await;
    assert_eq!(reply, Err(TransportError::Disconnected));
    assert_eq!(server.calls("getUser"), 0);
}

#[test]
fn empty_bodies_are_null_and_others_must_be_json() {
    assert_eq!(parse_body(b""), Ok(Value::Null));
    assert_eq!(parse_body(b"{\"a\":1}"), Ok(json!({ "a": 1 })));
    assert_eq!(parse_body(b"\"quoted\""), Ok(json!("quoted")));
    assert!(matches!(parse_body(b"<html>oops</html>"), Err(TransportError::Malformed(_))));
}

#[tokio::test]
async fn non_json_success_body_is_malformed() {
    let server = TestServer::start().await;
    let transport = HttpTransport::new(&server.http_endpoint(), None).expect("transport");

    let reply = transport.send_request(request(ProcedureKind::Query, "html", Value::Null)).await;

    assert!(matches!(reply, Err(TransportError::Malformed(_))), "{reply:?}");
}
