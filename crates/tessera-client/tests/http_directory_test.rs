//! Sessions established through the directory service over a real socket.

use std::net::SocketAddr;

use tessera_client::{
    BundleDirectory, DeviceIdentity, DirectoryError, HttpBundleDirectory, MemoryKeyValueStore,
    SessionConfig, SessionManager,
};
use tessera_proto::TopUpRequest;
use tessera_server::{MemoryBundleStore, Server, ServerRuntimeConfig};

async fn spawn_server() -> SocketAddr {
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".into(),
        ..ServerRuntimeConfig::default()
    };
    let server = Server::bind(config, MemoryBundleStore::new()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn http_directory(addr: SocketAddr, user_id: &str) -> HttpBundleDirectory {
    HttpBundleDirectory::new(&format!("http://{addr}/api/keys"), user_id).unwrap()
}

fn http_manager(
    addr: SocketAddr,
    user_id: &str,
) -> SessionManager<MemoryKeyValueStore, HttpBundleDirectory> {
    SessionManager::new(
        user_id,
        MemoryKeyValueStore::new(),
        http_directory(addr, user_id),
        SessionConfig::default(),
    )
}

#[tokio::test]
async fn test_conversation_over_http() {
    let addr = spawn_server().await;
    let mut alice = http_manager(addr, "alice");
    let mut bob = http_manager(addr, "bob");
    alice.ensure_registered().await.unwrap();
    bob.ensure_registered().await.unwrap();

    let first = alice.encrypt_for_peer("bob", b"hello over http").await.unwrap();
    assert!(first.x3dh.is_some());
    assert_eq!(bob.decrypt_from_peer("alice", &first).unwrap(), b"hello over http");

    let reply = bob.encrypt_for_peer("alice", b"hello back").await.unwrap();
    assert_eq!(alice.decrypt_from_peer("bob", &reply).unwrap(), b"hello back");
}

#[tokio::test]
async fn test_status_codes_map_to_directory_errors() {
    let addr = spawn_server().await;
    let directory = http_directory(addr, "alice");
    let identity = DeviceIdentity::generate(&mut rand::rngs::OsRng, 2);

    let receipt = directory.register_device(identity.registration()).await.unwrap();
    assert_eq!(receipt.device_id, identity.device_id());
    assert_eq!(receipt.one_time_pre_key_count, 2);

    let again = directory.register_device(identity.registration()).await;
    assert!(matches!(again, Err(DirectoryError::Conflict(_))));

    let missing = directory.fetch_bundle("nobody").await;
    assert!(matches!(missing, Err(DirectoryError::NotFound(_))));

    let empty = TopUpRequest {
        device_id: Some(identity.device_id().to_owned()),
        one_time_pre_keys: Vec::new(),
    };
    let rejected = directory.top_up(empty).await;
    assert!(matches!(rejected, Err(DirectoryError::InvalidArgument(_))));

    // Grants act for the caller's peer, not the caller
    let bundle = http_directory(addr, "bob").fetch_bundle("alice").await.unwrap();
    assert_eq!(bundle.device_id, identity.device_id());
}

#[tokio::test]
async fn test_unreachable_directory_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = http_directory(addr, "alice").fetch_bundle("bob").await;

    assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    assert!(result.unwrap_err().is_retryable());
}
