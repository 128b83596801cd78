//! End-to-end tests: blocking client against an in-process server.

mod util;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use fasttext_serving::daemon::core::ServerOptions;
use fasttext_serving::daemon::frame::FrameError;
use fasttext_serving::daemon::{ClientConfig, ClientError, ErrorCode, ServingClient, SharedKey, TransportSecurity};
use util::{TestServer, language_model, store_with};

fn lid_server(options: ServerOptions) -> TestServer {
    TestServer::start(store_with(vec![language_model()]), options)
}

#[test]
fn three_texts_with_k2_arrive_in_order() {
    let server = lid_server(ServerOptions::default());
    let results: Vec<_> = server
        .client()
        .predict(vec!["a", "b", "c"], 2, 0.0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(results.len(), 3);
    for result in &results {
        assert!(result.labels.len() <= 2);
        assert_eq!(result.labels.len(), result.probs.len());
    }
}

#[test]
fn languages_are_detected() {
    let server = lid_server(ServerOptions::default());
    let texts = vec!["bonjour le monde", "hello world", "hallo welt", "the world"];
    let labels: Vec<String> = server
        .client()
        .predict(texts, 1, 0.0)
        .unwrap()
        .map(|r| r.unwrap().labels.remove(0))
        .collect();
    assert_eq!(labels, vec!["fr", "en", "de", "en"]);
}

#[test]
fn threshold_filters_low_probabilities() {
    let server = lid_server(ServerOptions::default());
    let results: Vec<_> = server
        .client()
        .predict(vec!["bonjour".to_string()], 3, 0.5)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results[0].labels, vec!["fr"]);
    assert!(results[0].probs[0] >= 0.5);
}

#[test]
fn empty_input_closes_cleanly() {
    let server = lid_server(ServerOptions::default());
    let mut predictions = server
        .client()
        .predict(Vec::<String>::new(), 1, 0.0)
        .unwrap();
    assert_eq!(predictions.model().name, "lid");
    assert!(predictions.next().is_none());
}

#[test]
fn invalid_k_is_reported_not_dropped() {
    let server = lid_server(ServerOptions::default());
    let mut predictions = server
        .client()
        .predict(vec!["hello", "bonjour"], 0, 0.0)
        .unwrap();

    let err = predictions.next().unwrap().unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
    assert!(predictions.next().is_none());
}

#[test]
fn unknown_model_is_unavailable() {
    let server = lid_server(ServerOptions::default());
    let client = ServingClient::new(ClientConfig {
        model: Some("sentiment".to_string()),
        ..server.client_config()
    });
    let err = client.predict(vec!["hello"], 1, 0.0).err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ModelUnavailable));
}

#[test]
fn oversized_message_fails_only_its_session() {
    let server = lid_server(ServerOptions {
        max_message_bytes: 1024,
        ..ServerOptions::default()
    });

    let huge = "hello ".repeat(1000);
    let mut big = server.client().predict(vec![huge], 1, 0.0).unwrap();
    let healthy: Vec<_> = server
        .client()
        .predict(vec!["hallo"], 1, 0.0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let err = big.next().unwrap().unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ResourceExhausted));
    assert_eq!(healthy[0].labels, vec!["de"]);
}

#[test]
fn request_over_client_limit_surfaces_after_earlier_results() {
    let server = lid_server(ServerOptions::default());
    let client = ServingClient::new(ClientConfig {
        max_message_bytes: 1024,
        read_timeout: Some(Duration::from_secs(10)),
        ..server.client_config()
    });

    let texts = vec!["bonjour".to_string(), "hello ".repeat(1000)];
    let mut predictions = client.predict(texts, 1, 0.0).unwrap();

    assert_eq!(predictions.next().unwrap().unwrap().labels, vec!["fr"]);
    let err = predictions.next().unwrap().unwrap_err();
    assert!(
        matches!(err, ClientError::Frame(FrameError::TooLarge { .. })),
        "unexpected error: {err}"
    );
    assert!(predictions.next().is_none());
}

#[test]
fn sessions_over_the_limit_are_refused() {
    let server = lid_server(ServerOptions {
        max_sessions: 1,
        ..ServerOptions::default()
    });

    // Keep the first session open by feeding it from a channel.
    let (feed, inputs) = mpsc::channel::<String>();
    let mut first = server.client().predict(inputs, 1, 0.0).unwrap();

    let refused = server.client().predict(vec!["hello"], 1, 0.0).err().unwrap();
    assert_eq!(refused.code(), Some(ErrorCode::ResourceExhausted));
    assert!(matches!(refused, ClientError::Server { retryable: true, .. }));

    feed.send("bonjour".to_string()).unwrap();
    assert_eq!(first.next().unwrap().unwrap().labels, vec!["fr"]);
    drop(feed);
    assert!(first.next().is_none());

    // The slot frees once the first connection winds down.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match server.client().predict(vec!["hello"], 1, 0.0) {
            Ok(predictions) => {
                assert_eq!(predictions.count(), 1);
                break;
            }
            Err(e) if e.code() == Some(ErrorCode::ResourceExhausted) && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("session was not admitted: {e}"),
        }
    }
}

#[test]
fn unloading_keeps_open_sessions_working() {
    let server = lid_server(ServerOptions::default());
    let (feed, inputs) = mpsc::channel::<String>();
    let mut predictions = server.client().predict(inputs, 1, 0.0).unwrap();

    server.store.unload("lid").unwrap();
    feed.send("hello".to_string()).unwrap();
    assert_eq!(predictions.next().unwrap().unwrap().labels, vec!["en"]);
    drop(feed);
    assert!(predictions.next().is_none());

    // New sessions see the empty store.
    let err = server.client().predict(vec!["hello"], 1, 0.0).err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ModelUnavailable));
}

#[test]
fn encrypted_round_trip() {
    let key = SharedKey::generate();
    let server = lid_server(ServerOptions {
        security: TransportSecurity::Encrypted(key.clone()),
        ..ServerOptions::default()
    });
    let client = ServingClient::new(ClientConfig {
        security: TransportSecurity::Encrypted(key),
        ..server.client_config()
    });

    assert!(client.health().unwrap().ready);
    let results: Vec<_> = client
        .predict(vec!["bonjour", "hello"], 1, 0.0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results[0].labels, vec!["fr"]);
    assert_eq!(results[1].labels, vec!["en"]);
}

#[test]
fn wrong_key_fails_the_session() {
    let server = lid_server(ServerOptions {
        security: TransportSecurity::Encrypted(SharedKey::generate()),
        ..ServerOptions::default()
    });
    let client = ServingClient::new(ClientConfig {
        security: TransportSecurity::Encrypted(SharedKey::generate()),
        ..server.client_config()
    });
    assert!(client.predict(vec!["hello"], 1, 0.0).is_err());
}

#[test]
fn plaintext_client_cannot_talk_to_encrypted_server() {
    let server = lid_server(ServerOptions {
        security: TransportSecurity::Encrypted(SharedKey::generate()),
        ..ServerOptions::default()
    });
    let client = ServingClient::new(ClientConfig {
        read_timeout: Some(Duration::from_secs(1)),
        ..server.client_config()
    });
    assert!(client.health().is_err());
}

#[test]
fn status_counts_predictions() {
    let server = lid_server(ServerOptions::default());
    let client = server.client();
    assert_eq!(
        client.predict(vec!["a", "b"], 1, 0.0).unwrap().count(),
        2
    );

    let status = client.status().unwrap();
    assert_eq!(status.models.len(), 1);
    assert_eq!(status.models[0].name, "lid");
    assert_eq!(status.models[0].labels, vec!["en", "fr", "de"]);
    assert_eq!(status.total_predictions, 2);
    assert_eq!(status.total_sessions, 1);
    assert_eq!(status.max_sessions, 16);
}

fn http_request(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn http_batch_endpoint() {
    let server = TestServer::start_with_http(
        store_with(vec![language_model()]),
        ServerOptions {
            max_message_bytes: 4096,
            ..ServerOptions::default()
        },
    );
    let addr = server.http_addr.unwrap();

    let body = r#"["hallo welt", "bonjour"]"#;
    let response = http_request(
        addr,
        &format!(
            "POST /predict?k=1 HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    );
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    let (_, json) = response.split_once("\r\n\r\n").unwrap();
    let results: Vec<(Vec<String>, Vec<f32>)> = serde_json::from_str(json).unwrap();
    assert_eq!(results[0].0, vec!["de"]);
    assert_eq!(results[1].0, vec!["fr"]);

    let response = http_request(
        addr,
        "POST /predict HTTP/1.1\r\nContent-Length: 100000\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 413"), "{response}");

    let response = http_request(addr, "GET /health HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"ready\":true"));
}
