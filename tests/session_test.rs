//! Tests for chunked upload sessions against a mocked storage service

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use md5::{Digest, Md5};
use qiniu_uploader::config::{Config, ConfigOptions};
use qiniu_uploader::token::encode_key;
use qiniu_uploader::transport::RetryableTransport;
use qiniu_uploader::upload::{
    BlockAck, ChunkedUploadSession, DestinationKey, MemoryRecoveryStore, ProgressRecord,
    RecoveryStore, SessionStatus, UploadSource, UploadTarget,
};
use qiniu_uploader::{TransportError, UploadError};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MIB: usize = 1024 * 1024;
const BUCKET: &str = "bucket";
const KEY: &str = "big.bin";
const TOKEN: &str = "ak:sig:policy";

/// Answers block uploads with an etag derived from the part number
struct PartResponder;

impl Respond for PartResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let part = request.url.path().rsplit('/').next().unwrap_or("0").to_string();
        ResponseTemplate::new(200).set_body_json(json!({ "etag": format!("etag-{}", part) }))
    }
}

struct Harness {
    server: MockServer,
    config: Arc<Config>,
    transport: RetryableTransport,
    store: Arc<MemoryRecoveryStore>,
}

impl Harness {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let config = Config::new(
            server.uri(),
            ConfigOptions {
                tries_per_url: Some(1),
                retry_delay_ms: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        let transport = RetryableTransport::new(&config).unwrap();
        Self {
            server,
            config,
            transport,
            store: Arc::new(MemoryRecoveryStore::new()),
        }
    }

    fn destination(&self) -> DestinationKey {
        DestinationKey::new(BUCKET, KEY)
    }

    fn session(&self, target: UploadTarget) -> ChunkedUploadSession {
        ChunkedUploadSession::new(
            self.config.clone(),
            self.transport.clone(),
            self.store.clone(),
            target,
            self.destination(),
        )
    }

    fn default_session(&self) -> ChunkedUploadSession {
        self.session(UploadTarget::new(BUCKET, KEY, TOKEN))
    }

    fn uploads_path(&self) -> String {
        format!("/buckets/{}/objects/{}/uploads", BUCKET, encode_key(KEY))
    }

    async fn mount_init(&self, upload_id: &str) {
        Mock::given(method("POST"))
            .and(path(self.uploads_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": upload_id })))
            .mount(&self.server)
            .await;
    }

    async fn mount_parts(&self) {
        Mock::given(method("PUT"))
            .and(path_regex(r"^/buckets/bucket/objects/.+/uploads/.+/\d+$"))
            .respond_with(PartResponder)
            .mount(&self.server)
            .await;
    }

    async fn mount_complete(&self, upload_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("{}/{}", self.uploads_path(), upload_id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "hash": "Fhash", "key": KEY })),
            )
            .mount(&self.server)
            .await;
    }

    async fn requests(&self, verb: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == verb)
            .collect()
    }

    async fn completion_parts(&self, upload_id: &str) -> Vec<(String, u64)> {
        let completion_path = format!("{}/{}", self.uploads_path(), upload_id);
        let requests = self.requests("POST").await;
        let request = requests
            .iter()
            .rev()
            .find(|r| r.url.path() == completion_path)
            .expect("completion request");
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        body["parts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| {
                (
                    p["Etag"].as_str().unwrap().to_string(),
                    p["PartNumber"].as_u64().unwrap(),
                )
            })
            .collect()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

fn part_number(request: &Request) -> u64 {
    request.url.path().rsplit('/').next().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_uploads_ten_mib_in_three_blocks() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let data = payload(10 * MIB);
    let mut source = UploadSource::from_bytes(data.clone());
    let mut session = h.default_session();
    assert_eq!(session.status(), SessionStatus::Fresh);
    assert!(!session.status().is_terminal());
    assert_eq!(session.destination(), &h.destination());
    assert!(session.record().session_id.is_empty());

    let result = session
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    assert_eq!(result.hash, "Fhash");
    assert_eq!(result.key, KEY);
    assert_eq!(session.status(), SessionStatus::Done);
    assert!(!session.is_resumed());
    assert_eq!(session.blocks_sent(), 3);

    let puts = h.requests("PUT").await;
    let sizes: Vec<usize> = puts.iter().map(|r| r.body.len()).collect();
    assert_eq!(sizes, vec![4 * MIB, 4 * MIB, 2 * MIB]);
    assert_eq!(puts.iter().map(part_number).collect::<Vec<_>>(), vec![1, 2, 3]);

    assert_eq!(
        h.completion_parts("up-1").await,
        vec![
            ("etag-1".to_string(), 1),
            ("etag-2".to_string(), 2),
            ("etag-3".to_string(), 3)
        ]
    );
    // Record is removed once the object is assembled
    assert!(!h.store.contains(&h.destination()));
}

#[tokio::test]
async fn test_requests_carry_upload_token() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.uploads_path()))
        .and(header("Authorization", "UpToken ak:sig:policy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": "up-1" })))
        .expect(1)
        .mount(&h.server)
        .await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let mut source = UploadSource::from_bytes(payload(MIB));
    h.default_session()
        .upload(&mut source, Some(MIB as u64))
        .await
        .unwrap();

    for request in h.requests("PUT").await {
        assert_eq!(
            request.headers.get("authorization").unwrap().to_str().unwrap(),
            "UpToken ak:sig:policy"
        );
        assert_eq!(
            request.headers.get("content-type").unwrap().to_str().unwrap(),
            "application/octet-stream"
        );
    }
}

#[tokio::test]
async fn test_resume_after_interruption_uploads_only_remaining_blocks() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    // Third block fails once
    Mock::given(method("PUT"))
        .and(path(format!("{}/up-1/3", h.uploads_path())))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "connection reset" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&h.server)
        .await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let data = payload(10 * MIB);

    let mut first = h.default_session();
    let mut source = UploadSource::from_bytes(data.clone());
    let err = first
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        UploadError::Transport(e) if e.status() == Some(400)
    ));
    assert_eq!(first.status(), SessionStatus::Failed);
    assert!(first.status().is_terminal());
    assert_eq!(first.record().session_id, "up-1");
    assert_eq!(first.record().uploaded_bytes, 8 * MIB as u64);

    let persisted = h.store.load(&h.destination()).unwrap().unwrap();
    assert_eq!(persisted.session_id, "up-1");
    assert_eq!(persisted.blocks.len(), 2);
    assert_eq!(persisted.uploaded_bytes, 8 * MIB as u64);

    let mut second = h.default_session();
    let mut source = UploadSource::from_bytes(data.clone());
    let result = second
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();
    assert_eq!(result.key, KEY);
    assert!(second.is_resumed());
    assert_eq!(second.blocks_sent(), 1);

    // One init overall, and the resumed run started at offset 8 MiB
    let inits: Vec<_> = h
        .requests("POST")
        .await
        .into_iter()
        .filter(|r| r.url.path() == h.uploads_path())
        .collect();
    assert_eq!(inits.len(), 1);

    let puts = h.requests("PUT").await;
    assert_eq!(puts.iter().map(part_number).collect::<Vec<_>>(), vec![1, 2, 3, 3]);
    let resumed = puts.last().unwrap();
    assert_eq!(resumed.body, data[8 * MIB..].to_vec());

    let parts = h.completion_parts("up-1").await;
    assert_eq!(parts.iter().map(|(_, n)| *n).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(!h.store.contains(&h.destination()));
}

#[tokio::test]
async fn test_resume_from_sequential_source_discards_uploaded_bytes() {
    let h = Harness::start().await;
    h.mount_parts().await;
    h.mount_complete("up-7").await;

    let mut record = ProgressRecord::new("up-7");
    record.push_block("etag-1", 4 * MIB as u64);
    h.store.save(&h.destination(), &record).unwrap();

    let data = payload(6 * MIB);
    let mut source = UploadSource::sequential(std::io::Cursor::new(data.clone()));
    let mut session = h.default_session();
    session
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    let puts = h.requests("PUT").await;
    assert_eq!(puts.len(), 1);
    assert_eq!(part_number(&puts[0]), 2);
    assert_eq!(puts[0].body, data[4 * MIB..].to_vec());
}

#[tokio::test]
async fn test_stale_record_starts_new_session() {
    let h = Harness::start().await;
    h.mount_init("fresh").await;
    h.mount_parts().await;
    h.mount_complete("fresh").await;

    let mut record = ProgressRecord::new("old-session");
    record.push_block("etag-old", 4 * MIB as u64);
    record.created_at = Utc::now() - ChronoDuration::days(6);
    h.store.save(&h.destination(), &record).unwrap();

    let data = payload(5 * MIB);
    let mut source = UploadSource::from_bytes(data.clone());
    let mut session = h.default_session();
    session
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    assert!(!session.is_resumed());
    let puts = h.requests("PUT").await;
    assert_eq!(puts.len(), 2);
    assert!(puts.iter().all(|r| r.url.path().contains("/uploads/fresh/")));
}

#[tokio::test]
async fn test_gapped_record_starts_new_session() {
    let h = Harness::start().await;
    h.mount_init("fresh").await;
    h.mount_parts().await;
    h.mount_complete("fresh").await;

    let mut record = ProgressRecord::new("old-session");
    record.blocks = vec![
        BlockAck {
            etag: "e1".to_string(),
            part_num: 1,
        },
        BlockAck {
            etag: "e3".to_string(),
            part_num: 3,
        },
    ];
    record.uploaded_bytes = 8 * MIB as u64;
    h.store.save(&h.destination(), &record).unwrap();

    let data = payload(10 * MIB);
    let mut source = UploadSource::from_bytes(data.clone());
    let mut session = h.default_session();
    session
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    assert!(!session.is_resumed());
    assert_eq!(h.requests("PUT").await.len(), 3);
    assert_eq!(
        h.completion_parts("fresh").await.len(),
        3
    );
}

#[tokio::test]
async fn test_corrupt_record_is_ignored() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    h.store.insert_raw(&h.destination(), "{\"sessionId\": 42");

    let mut source = UploadSource::from_bytes(payload(MIB));
    let mut session = h.default_session();
    session.upload(&mut source, Some(MIB as u64)).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Done);
}

#[tokio::test]
async fn test_completion_failure_keeps_record_and_retry_skips_blocks() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/up-1", h.uploads_path())))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "try later" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&h.server)
        .await;
    h.mount_complete("up-1").await;

    let data = payload(10 * MIB);

    let mut first = h.default_session();
    let mut source = UploadSource::from_bytes(data.clone());
    let err = first
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Transport(_)));
    assert_eq!(first.status(), SessionStatus::Failed);

    let persisted = h.store.load(&h.destination()).unwrap().unwrap();
    assert_eq!(persisted.blocks.len(), 3);
    assert_eq!(persisted.uploaded_bytes, data.len() as u64);

    let mut second = h.default_session();
    let mut source = UploadSource::from_bytes(data.clone());
    let result = second
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    assert_eq!(result.hash, "Fhash");
    assert_eq!(second.blocks_sent(), 0);
    assert_eq!(h.requests("PUT").await.len(), 3);
    assert!(!h.store.contains(&h.destination()));
}

#[tokio::test]
async fn test_block_checksum_header() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let data = payload(MIB);
    let mut source = UploadSource::from_bytes(data.clone());
    h.default_session()
        .upload(&mut source, Some(data.len() as u64))
        .await
        .unwrap();

    let puts = h.requests("PUT").await;
    let expected = hex::encode(Md5::digest(&data));
    assert_eq!(
        puts[0].headers.get("content-md5").unwrap().to_str().unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_checksum_can_be_disabled() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let mut target = UploadTarget::new(BUCKET, KEY, TOKEN);
    target.disable_checksum = true;

    let mut source = UploadSource::from_bytes(payload(MIB));
    h.session(target)
        .upload(&mut source, Some(MIB as u64))
        .await
        .unwrap();

    let puts = h.requests("PUT").await;
    assert!(puts[0].headers.get("content-md5").is_none());
}

#[tokio::test]
async fn test_rejected_checksum_names_the_block() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(406).set_body_json(json!({ "error": "crc mismatch" })))
        .mount(&h.server)
        .await;

    let mut source = UploadSource::from_bytes(payload(MIB));
    let mut session = h.default_session();
    let err = session
        .upload(&mut source, Some(MIB as u64))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::ChecksumMismatch { part_num: Some(1) }
    ));
}

#[tokio::test]
async fn test_metadata_sent_on_completion() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/up-1", h.uploads_path())))
        .and(header("x-qn-meta-owner", "ops"))
        .and(header("content-type", "text/plain"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "hash": "Fhash", "key": KEY })),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let mut target = UploadTarget::new(BUCKET, KEY, TOKEN);
    target.meta.insert("owner".to_string(), "ops".to_string());

    let mut source = UploadSource::from_bytes(payload(MIB));
    h.session(target)
        .upload(&mut source, Some(MIB as u64))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_source_fails_locally() {
    let h = Harness::start().await;

    let mut source = UploadSource::from_bytes(Vec::new());
    let mut session = h.default_session();
    let err = session.upload(&mut source, Some(0)).await.unwrap_err();

    assert!(matches!(err, UploadError::IncompleteUpload(_)));
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_stream_of_unknown_size_fails_before_initiating() {
    let h = Harness::start().await;

    let mut source = UploadSource::sequential(std::io::Cursor::new(Vec::new()));
    let mut session = h.default_session();
    let err = session.upload(&mut source, None).await.unwrap_err();

    assert!(matches!(err, UploadError::IncompleteUpload(_)));
    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(h.server.received_requests().await.unwrap().is_empty());
    assert!(!h.store.contains(&h.destination()));
}

#[tokio::test]
async fn test_unknown_size_stream_uploads_until_end() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let data = payload(6 * MIB);
    let mut source = UploadSource::sequential(std::io::Cursor::new(data.clone()));
    let mut session = h.default_session();
    session.upload(&mut source, None).await.unwrap();

    let puts = h.requests("PUT").await;
    let sizes: Vec<usize> = puts.iter().map(|r| r.body.len()).collect();
    assert_eq!(sizes, vec![4 * MIB, 2 * MIB]);
    assert_eq!(h.completion_parts("up-1").await.len(), 2);
}

#[tokio::test]
async fn test_stream_longer_than_declared_size_is_not_completed() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let mut source = UploadSource::sequential(std::io::Cursor::new(payload(10 * MIB)));
    let mut session = h.default_session();
    let err = session
        .upload(&mut source, Some(5 * MIB as u64))
        .await
        .unwrap_err();

    assert!(matches!(&err, UploadError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData));
    assert_eq!(session.status(), SessionStatus::Failed);

    // Only the declared bytes went out
    let sizes: Vec<usize> = h.requests("PUT").await.iter().map(|r| r.body.len()).collect();
    assert_eq!(sizes, vec![4 * MIB, MIB]);
    assert_eq!(session.record().uploaded_bytes, 5 * MIB as u64);

    let completions = h
        .requests("POST")
        .await
        .into_iter()
        .filter(|r| r.url.path() != h.uploads_path())
        .count();
    assert_eq!(completions, 0);
}

#[tokio::test]
async fn test_stream_shorter_than_declared_size_is_not_completed() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let mut source = UploadSource::sequential(std::io::Cursor::new(payload(6 * MIB)));
    let mut session = h.default_session();
    let err = session
        .upload(&mut source, Some(10 * MIB as u64))
        .await
        .unwrap_err();

    assert!(matches!(&err, UploadError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    assert_eq!(h.requests("PUT").await.len(), 2);

    let completions = h
        .requests("POST")
        .await
        .into_iter()
        .filter(|r| r.url.path() != h.uploads_path())
        .count();
    assert_eq!(completions, 0);

    // Acknowledged blocks stay on record
    let persisted = h.store.load(&h.destination()).unwrap().unwrap();
    assert_eq!(persisted.uploaded_bytes, 6 * MIB as u64);
}

#[tokio::test]
async fn test_session_cannot_be_driven_twice() {
    let h = Harness::start().await;
    h.mount_init("up-1").await;
    h.mount_parts().await;
    h.mount_complete("up-1").await;

    let mut session = h.default_session();
    let mut source = UploadSource::from_bytes(payload(MIB));
    session.upload(&mut source, Some(MIB as u64)).await.unwrap();

    let mut source = UploadSource::from_bytes(payload(MIB));
    assert!(session.upload(&mut source, Some(MIB as u64)).await.is_err());
    assert_eq!(session.status(), SessionStatus::Done);
}

#[tokio::test]
async fn test_abort_deletes_server_session_and_record() {
    let h = Harness::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/up-9", h.uploads_path())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&h.server)
        .await;

    let mut record = ProgressRecord::new("up-9");
    record.push_block("etag-1", 4 * MIB as u64);
    h.store.save(&h.destination(), &record).unwrap();

    let mut session = h.default_session();
    assert!(session.abort().await.unwrap());
    assert!(!h.store.contains(&h.destination()));

    // Nothing left to abort
    assert!(!session.abort().await.unwrap());
}
