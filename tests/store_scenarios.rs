use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use panel_vault::codec::Envelope;
use panel_vault::{
    BackendKind, ClearTarget, KeyStatus, KeyValueArea, LocalArea, NewMessage, SealMode, Store,
    StoreConfig, StoreError,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const SECRET: &str = "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Host bridge whose writes always fail.
struct BrokenHost;

impl KeyValueArea for BrokenHost {
    fn get_item(&self, _key: &str) -> panel_vault::Result<Option<String>> {
        Ok(None)
    }
    fn set_item(&self, _key: &str, _value: &str) -> panel_vault::Result<()> {
        Err(StoreError::Backend("host store is read-only".to_string()))
    }
    fn remove_item(&self, _key: &str) -> panel_vault::Result<()> {
        Ok(())
    }
    fn keys(&self) -> panel_vault::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn native_config(dir: &Path) -> StoreConfig {
    StoreConfig::with_base_dir(dir)
}

fn fallback_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        disable_native: true,
        ..StoreConfig::with_base_dir(dir)
    }
}

fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out
}

async fn round_trip(store: &Store) {
    let record = [
        ("apiKey", json!(SECRET)),
        ("provider", json!("openai")),
        ("model", json!("gpt-4o")),
        ("memory", json!("Prefers expressions over keyframes.")),
        ("panel", json!({"width": 420, "docked": true})),
    ];
    for (key, value) in &record {
        store.set(key, value.clone()).await.unwrap();
    }
    for (key, value) in &record {
        assert_eq!(&store.get(key, Value::Null).await, value, "key {}", key);
    }
}

#[tokio::test]
async fn settings_round_trip_on_every_backend() {
    let tmp = TempDir::new().unwrap();

    let native = Store::open(native_config(&tmp.path().join("native"))).unwrap();
    assert_eq!(native.backend_kind(), BackendKind::NativeEncrypted);
    assert_eq!(native.seal_mode(), SealMode::Encrypted);
    round_trip(&native).await;

    let fallback = Store::open(fallback_config(&tmp.path().join("fallback"))).unwrap();
    assert_eq!(fallback.backend_kind(), BackendKind::BrowserFallback);
    assert_eq!(fallback.seal_mode(), SealMode::Obfuscated);
    round_trip(&fallback).await;

    let host: Arc<dyn KeyValueArea> = Arc::new(LocalArea::in_memory());
    let bridged = Store::builder(native_config(&tmp.path().join("bridged")))
        .host_bridge(host)
        .build()
        .unwrap();
    assert_eq!(bridged.backend_kind(), BackendKind::HostBridge);
    assert_eq!(
        bridged.chain(),
        vec![
            BackendKind::HostBridge,
            BackendKind::NativeEncrypted,
            BackendKind::BrowserFallback
        ]
    );
    round_trip(&bridged).await;
}

#[tokio::test]
async fn credentials_survive_restart_without_cleartext() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(native_config(tmp.path())).unwrap();
        assert_eq!(store.key_status(), Some(KeyStatus::Created));
        store.set("apiKey", json!(SECRET)).await.unwrap();
        store.set("provider", json!("openai")).await.unwrap();
    }

    let store = Store::open(native_config(tmp.path())).unwrap();
    assert_eq!(store.key_status(), Some(KeyStatus::Loaded));
    assert_eq!(store.get_string("apiKey").await.as_deref(), Some(SECRET));
    assert_eq!(store.get_string("provider").await.as_deref(), Some("openai"));

    let windows: Vec<&str> = (0..=SECRET.len() - 8).map(|i| &SECRET[i..i + 8]).collect();
    for file in files_under(tmp.path()) {
        let text = String::from_utf8_lossy(&std::fs::read(&file).unwrap()).into_owned();
        for window in &windows {
            assert!(
                !text.contains(window),
                "{} leaks {:?} in cleartext",
                file.display(),
                window
            );
        }
    }
}

#[tokio::test]
async fn five_hundred_messages_rotate_and_reassemble() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        rotation_threshold_bytes: 64 * 1024,
        ..native_config(tmp.path())
    };
    let store = Store::open(config).unwrap();
    let id = "comp-notes";

    for i in 0..500 {
        let text = format!("{:04} {}", i, "x".repeat(195));
        store.append_message(id, NewMessage::user(text)).await.unwrap();
    }

    let segments = store.conversation_segments(id).await.unwrap();
    assert!(segments.len() >= 2, "expected at least one archive, got {:?}", segments);
    assert!(segments[..segments.len() - 1]
        .iter()
        .all(|s| s.starts_with("archive-")));
    assert_eq!(segments.last().map(String::as_str), Some("active"));

    for file in files_under(&tmp.path().join("conversations").join(id)) {
        let len = std::fs::metadata(&file).unwrap().len();
        assert!(len <= 64 * 1024, "{} is {} bytes", file.display(), len);
    }

    assert_eq!(store.list_conversations().await.unwrap(), vec![id.to_string()]);
    let conversation = store.read_conversation(id).await.unwrap();
    assert_eq!(conversation.messages.len(), 500);
    for (i, message) in conversation.messages.iter().enumerate() {
        assert!(message.text.starts_with(&format!("{:04} ", i)));
    }
}

#[tokio::test]
async fn dotted_conversation_ids_are_listed() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(native_config(tmp.path())).unwrap();
    for id in [".chat.tmp", "plain"] {
        store.append_message(id, NewMessage::user("hi")).await.unwrap();
    }
    assert_eq!(
        store.list_conversations().await.unwrap(),
        vec![".chat.tmp".to_string(), "plain".to_string()]
    );

    // Reopening sweeps stale temp files but leaves the conversation alone.
    drop(store);
    let store = Store::open(native_config(tmp.path())).unwrap();
    assert_eq!(store.read_conversation(".chat.tmp").await.unwrap().messages.len(), 1);
}

#[tokio::test]
async fn reads_fall_through_to_lower_backends() {
    let tmp = TempDir::new().unwrap();
    {
        let native = Store::open(native_config(tmp.path())).unwrap();
        native.set("memory", json!("likes wiggle()")).await.unwrap();
        native
            .append_message("old-chat", NewMessage::assistant("stored natively"))
            .await
            .unwrap();
    }

    let host: Arc<dyn KeyValueArea> = Arc::new(LocalArea::in_memory());
    let store = Store::builder(native_config(tmp.path()))
        .host_bridge(host)
        .build()
        .unwrap();
    assert_eq!(store.backend_kind(), BackendKind::HostBridge);
    assert_eq!(store.get("memory", Value::Null).await, json!("likes wiggle()"));
    assert_eq!(store.list_conversations().await.unwrap(), vec!["old-chat".to_string()]);
    let conversation = store.read_conversation("old-chat").await.unwrap();
    assert_eq!(conversation.messages[0].text, "stored natively");

    // New writes land in the host bridge and shadow the native value.
    store.set("memory", json!("likes loopOut()")).await.unwrap();
    assert_eq!(store.get("memory", Value::Null).await, json!("likes loopOut()"));
}

#[tokio::test]
async fn writes_mirror_to_fallback_when_enabled() {
    let tmp = TempDir::new().unwrap();
    let area = Arc::new(LocalArea::in_memory());
    let config = StoreConfig {
        mirror_to_fallback: true,
        ..native_config(tmp.path())
    };
    let store = Store::builder(config).fallback_area(area.clone()).build().unwrap();
    store.set("provider", json!("anthropic")).await.unwrap();
    store.append_message("m1", NewMessage::user("hi")).await.unwrap();

    let browser_only = Store::builder(fallback_config(tmp.path()))
        .fallback_area(area)
        .build()
        .unwrap();
    assert_eq!(browser_only.get("provider", Value::Null).await, json!("anthropic"));
    let conversation = browser_only.read_conversation("m1").await.unwrap();
    assert_eq!(conversation.messages.len(), 1);
}

#[tokio::test]
async fn credentials_are_not_mirrored_to_a_fallback_file() {
    let tmp = TempDir::new().unwrap();
    let fallback_file = tmp.path().join("local-storage.json");
    let config = StoreConfig {
        mirror_to_fallback: true,
        fallback_path: Some(fallback_file.clone()),
        ..native_config(tmp.path())
    };
    let store = Store::open(config).unwrap();
    assert_eq!(store.seal_mode(), SealMode::Encrypted);
    store.set("apiKey", json!(SECRET)).await.unwrap();
    store.set("provider", json!("openai")).await.unwrap();
    assert_eq!(store.get_string("apiKey").await.as_deref(), Some(SECRET));

    // Decode every obfuscated envelope in the file and look for the key.
    let raw = std::fs::read_to_string(&fallback_file).unwrap();
    let items: std::collections::BTreeMap<String, String> = serde_json::from_str(&raw).unwrap();
    assert!(!items.is_empty());
    for sealed in items.values() {
        let envelope: Envelope = serde_json::from_str(sealed).unwrap();
        let plain = String::from_utf8(BASE64.decode(&envelope.payload).unwrap()).unwrap();
        assert!(!plain.contains(SECRET), "fallback file holds {}", plain);
        assert!(!plain.contains("apiKey"));
    }
    assert!(!raw.contains(SECRET));

    // Non-credential settings still reach the mirror.
    let browser_only = Store::open(StoreConfig {
        fallback_path: Some(fallback_file),
        ..fallback_config(tmp.path())
    })
    .unwrap();
    assert_eq!(browser_only.get("provider", Value::Null).await, json!("openai"));
    assert_eq!(browser_only.get("apiKey", Value::Null).await, Value::Null);
}

#[tokio::test]
async fn primary_failure_is_reported_even_when_mirror_succeeds() {
    let tmp = TempDir::new().unwrap();
    let area = Arc::new(LocalArea::in_memory());
    let config = StoreConfig {
        mirror_to_fallback: true,
        ..native_config(tmp.path())
    };
    let store = Store::builder(config)
        .host_bridge(Arc::new(BrokenHost))
        .fallback_area(area.clone())
        .build()
        .unwrap();

    let err = store.set("provider", json!("openai")).await.unwrap_err();
    assert!(matches!(err, StoreError::FatalStorage(_)), "got {:?}", err);

    // The mirror still took the write; the caller learns the primary did not.
    let browser_only = Store::builder(fallback_config(tmp.path()))
        .fallback_area(area)
        .build()
        .unwrap();
    assert_eq!(browser_only.get("provider", Value::Null).await, json!("openai"));
}

#[tokio::test]
async fn export_is_redacted() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(native_config(tmp.path())).unwrap();
    let token = "Q1w2E3r4T5y6U7i8O9p0A1s2D3f4G5h6J7k8L9z0";
    assert_eq!(token.len(), 40);
    store
        .append_message("leaky", NewMessage::user(format!("my key is {}", token)))
        .await
        .unwrap();
    store
        .append_message(
            "leaky",
            NewMessage::assistant("call it with Authorization: Bearer abc.def.ghi-jkl")
                .with_meta("apiKey", json!(SECRET)),
        )
        .await
        .unwrap();

    let bytes = store.export_conversation("leaky").await.unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(!text.contains(token));
    assert!(!text.contains(SECRET));
    assert!(!text.contains("abc.def.ghi-jkl"));
    assert!(text.contains("[REDACTED]"));

    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["id"], "leaky");
    assert_eq!(parsed["messageCount"], 2);

    // Stored data is untouched by export.
    let conversation = store.read_conversation("leaky").await.unwrap();
    assert!(conversation.messages[0].text.contains(token));

    let out = tmp.path().join("exports/leaky.json");
    store.export_conversation_to_file("leaky", &out).await.unwrap();
    let saved = std::fs::read_to_string(&out).unwrap();
    assert!(!saved.contains(token));
}

#[tokio::test]
async fn export_redacts_tokens_glued_to_other_text() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(native_config(tmp.path())).unwrap();
    let token = "Z9y8X7w6V5u4T3s2R1q0P9o8N7m6L5k4J3i2H1g0";
    let prefixes = ["OPENAI_KEY_", "key_", "密钥", "é", "token=", "\"", "path/"];
    for prefix in &prefixes {
        store
            .append_message("glued", NewMessage::user(format!("{}{}_prod", prefix, token)))
            .await
            .unwrap();
    }
    store
        .append_message(
            "glued",
            NewMessage::user("export OPENAI_API_KEY=sk-bbbbbbbbbbbbbbbbbbbbbbbb"),
        )
        .await
        .unwrap();

    let text = String::from_utf8(store.export_conversation("glued").await.unwrap()).unwrap();
    assert!(!text.contains(token), "export leaked the token: {}", text);
    assert!(!text.contains("sk-bbbbbbbbbbbbbbbbbbbbbbbb"));
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["messageCount"], prefixes.len() + 1);
    assert_eq!(parsed["messages"][0]["text"], "OPENAI_KEY_[REDACTED]_prod");
}

#[tokio::test]
async fn clear_removes_records_everywhere() {
    let tmp = TempDir::new().unwrap();
    let area = Arc::new(LocalArea::in_memory());
    let config = StoreConfig {
        mirror_to_fallback: true,
        ..native_config(tmp.path())
    };
    let store = Store::builder(config).fallback_area(area.clone()).build().unwrap();
    store.set("apiKey", json!(SECRET)).await.unwrap();
    store.set("provider", json!("openai")).await.unwrap();
    store.append_message("gone", NewMessage::user("bye")).await.unwrap();

    store.clear(ClearTarget::Setting("apiKey".to_string())).await.unwrap();
    store.clear(ClearTarget::Conversation("gone".to_string())).await.unwrap();

    assert_eq!(store.get("apiKey", Value::Null).await, Value::Null);
    assert_eq!(store.get("provider", Value::Null).await, json!("openai"));
    assert!(store.list_conversations().await.unwrap().is_empty());
    assert!(matches!(
        store.read_conversation("gone").await,
        Err(StoreError::NotFound(_))
    ));

    let browser_only = Store::builder(fallback_config(tmp.path()))
        .fallback_area(area)
        .build()
        .unwrap();
    assert_eq!(browser_only.get("apiKey", Value::Null).await, Value::Null);
    assert!(browser_only.list_conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn tampered_settings_read_as_default() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(native_config(tmp.path())).unwrap();
    store.set("provider", json!("openai")).await.unwrap();

    let path = tmp.path().join("settings.json");
    let mut envelope: Envelope = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let mut raw = BASE64.decode(&envelope.payload).unwrap();
    raw[20] ^= 0xff;
    envelope.payload = BASE64.encode(raw);
    std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

    assert_eq!(store.get("provider", json!("fallback")).await, json!("fallback"));

    // The next write replaces the unreadable record.
    store.set("provider", json!("gemini")).await.unwrap();
    assert_eq!(store.get("provider", Value::Null).await, json!("gemini"));
}

#[tokio::test]
async fn corrupt_key_file_is_regenerated() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(native_config(tmp.path())).unwrap();
        store.set("apiKey", json!(SECRET)).await.unwrap();
    }
    std::fs::write(tmp.path().join("store.key"), b"{broken").unwrap();

    let store = Store::open(native_config(tmp.path())).unwrap();
    assert_eq!(store.key_status(), Some(KeyStatus::Regenerated));
    // Old ciphertext is unreadable under the new key; never a wrong value.
    assert_eq!(store.get("apiKey", Value::Null).await, Value::Null);
}

#[tokio::test]
async fn fallback_area_persists_between_sessions() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        fallback_path: Some(tmp.path().join("local-storage.json")),
        ..fallback_config(tmp.path())
    };
    {
        let store = Store::open(config.clone()).unwrap();
        store.set("model", json!("claude-sonnet")).await.unwrap();
    }
    let store = Store::open(config).unwrap();
    assert_eq!(store.get("model", Value::Null).await, json!("claude-sonnet"));

    let raw = std::fs::read_to_string(tmp.path().join("local-storage.json")).unwrap();
    assert!(raw.contains("obfuscated"));
}
