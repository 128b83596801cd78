use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use fasttext_serving::daemon::core::{ModelServer, ServerHandle, ServerOptions};
use fasttext_serving::daemon::http::serve_http;
use fasttext_serving::daemon::{ClientConfig, ServingClient};
use fasttext_serving::model::format::write_model;
use fasttext_serving::model::{EOS, Model, ModelParts, ModelStore};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

#[allow(dead_code)]
pub struct TempFixtureDir {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TempFixtureDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Write `parts` as `<name>.ftsm` and return the path.
    pub fn write_model(&self, name: &str, parts: &ModelParts) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.ftsm"));
        write_model(&path, parts).expect("write model");
        path
    }
}

/// Three-language identifier over a tiny vocabulary.
///
/// Each known word pushes its language's logit; unknown words and `</s>`
/// contribute nothing.
#[allow(dead_code)]
pub fn language_parts() -> ModelParts {
    let words = [
        ("hello", 0),
        ("world", 0),
        ("the", 0),
        ("bonjour", 1),
        ("le", 1),
        ("monde", 1),
        ("hallo", 2),
        ("welt", 2),
        ("die", 2),
    ];
    let mut input = Vec::new();
    let mut vocab = Vec::new();
    for (word, lang) in words {
        vocab.push(word.to_string());
        let mut row = [0.0f32; 3];
        row[lang] = 2.0;
        input.extend_from_slice(&row);
    }
    vocab.push(EOS.to_string());
    input.extend_from_slice(&[0.0; 3]);

    ModelParts {
        labels: vec![
            "__label__en".to_string(),
            "__label__fr".to_string(),
            "__label__de".to_string(),
        ],
        dim: 3,
        words: vocab,
        buckets: 0,
        minn: 0,
        maxn: 0,
        word_ngrams: 1,
        input,
        output: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    }
}

#[allow(dead_code)]
pub fn language_model() -> Model {
    Model::from_parts("lid", language_parts()).expect("valid fixture")
}

/// Random weights with subword and word n-gram buckets, seeded.
#[allow(dead_code)]
pub fn hashed_parts(seed: u64) -> ModelParts {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let labels: Vec<String> = (0..6).map(|i| format!("__label__c{i}")).collect();
    let mut words: Vec<String> = (0..120).map(|i| format!("w{i}")).collect();
    words.push(EOS.to_string());
    let dim = 16usize;
    let buckets = 2048u32;
    let rows = words.len() + buckets as usize;

    let input = (0..rows * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let output = (0..labels.len() * dim)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();

    ModelParts {
        labels,
        dim: dim as u32,
        words,
        buckets,
        minn: 2,
        maxn: 4,
        word_ngrams: 2,
        input,
        output,
    }
}

#[allow(dead_code)]
pub fn hashed_model(seed: u64) -> Model {
    Model::from_parts("hashed", hashed_parts(seed)).expect("valid fixture")
}

/// `n` distinct texts mixing known words, unknown words and n-gram material.
#[allow(dead_code)]
pub fn distinct_texts(seed: u64, n: usize) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let len = rng.gen_range(1..8);
            let mut words: Vec<String> = (0..len)
                .map(|_| match rng.gen_range(0..3) {
                    0 => format!("w{}", rng.gen_range(0..120)),
                    1 => format!("x{}", rng.gen_range(0..10_000)),
                    _ => "hello".to_string(),
                })
                .collect();
            // The index keeps every text distinct.
            words.push(format!("id{i}"));
            words.join(" ")
        })
        .collect()
}

/// A server running on its own runtime thread, stopped on drop.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub store: Arc<ModelStore>,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestServer {
    pub fn start(store: ModelStore, options: ServerOptions) -> Self {
        Self::start_inner(store, options, false)
    }

    pub fn start_with_http(store: ModelStore, options: ServerOptions) -> Self {
        Self::start_inner(store, options, true)
    }

    fn start_inner(store: ModelStore, options: ServerOptions, http: bool) -> Self {
        let store = Arc::new(store);
        let server = ModelServer::new(options, Arc::clone(&store));
        let handle = server.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind");
                let addr = listener.local_addr().expect("local addr");
                let http_addr = if http {
                    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                        .await
                        .expect("bind http");
                    let http_addr = http_listener.local_addr().expect("local addr");
                    tokio::spawn(serve_http(server.state(), http_listener));
                    Some(http_addr)
                } else {
                    None
                };
                tx.send((addr, http_addr)).expect("report address");
                server.serve(listener).await.expect("serve");
            });
        });

        let (addr, http_addr) = rx.recv().expect("server started");
        Self {
            addr,
            http_addr,
            store,
            handle,
            thread: Some(thread),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            address: self.addr.to_string(),
            ..ClientConfig::default()
        }
    }

    pub fn client(&self) -> ServingClient {
        ServingClient::new(self.client_config())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Store holding the given models; the first becomes the default.
#[allow(dead_code)]
pub fn store_with(models: Vec<Model>) -> ModelStore {
    let store = ModelStore::new();
    for model in models {
        store.insert(model);
    }
    store
}
