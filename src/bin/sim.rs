//! End-to-end mesh demo: wires a handful of simulated devices together
//! in-process, joins them to a shared group, and sends a chat message
//! across a multi-hop path.
//!
//! Usage:
//!   fluxon-sim --devices 4

use clap::Parser;
use fluxon_core::config::MeshConfig;
use fluxon_core::group;
use fluxon_core::identity::Identity;
use fluxon_core::keystore::MemoryKeystore;
use fluxon_core::relay::MeshRelay;
use fluxon_core::transport::InProcessMeshFabric;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "fluxon-sim", version, about = "FluxonApp mesh relay demo")]
struct Args {
    /// Number of simulated devices, wired in a line topology
    #[arg(short, long, default_value_t = 4)]
    devices: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    fluxon_core::telemetry::init_tracing();
    let args = Args::parse();
    let config = MeshConfig::default();

    let fabric = InProcessMeshFabric::new();
    let mut identities = Vec::new();
    let mut relays = Vec::new();

    for i in 0..args.devices {
        let ks = MemoryKeystore::new();
        let mut identity = Identity::new(config.trusted_peer_cap);
        identity.initialize(&ks).await.unwrap();
        let peer_id = identity.peer_id().unwrap();
        let (transport, mut rx) = fabric.add_device(peer_id);
        let relay = Arc::new(MeshRelay::new(peer_id, &config, transport));

        let relay_for_task = relay.clone();
        tokio::spawn(async move {
            while let Some((from, frame)) = rx.recv().await {
                let now = now_ms();
                relay_for_task.handle_inbound(&frame, from, now).await;
            }
        });

        info!(device = i, peer_id = %peer_id, "device online");
        identities.push(identity);
        relays.push(relay);
    }

    for i in 0..args.devices.saturating_sub(1) {
        fabric.connect(identities[i].peer_id().unwrap(), identities[i + 1].peer_id().unwrap());
    }

    for i in 0..args.devices {
        for j in 0..args.devices {
            if i == j {
                continue;
            }
            relays[i]
                .register_peer_key(identities[j].peer_id().unwrap(), identities[j].verifying_key().unwrap())
                .await;
        }
    }

    let passphrase = "trekkers2024";
    let salt = group::generate_salt();
    let mesh_group = group::join_group("demo".into(), passphrase, &salt, &config.argon2_params).unwrap();

    let mut sub = relays[args.devices - 1].subscribe();
    let plaintext = fluxon_core::codec::encode_chat(&fluxon_core::types::ChatPayload {
        sender_name: "device-0".into(),
        text: "hello from the far end of the mesh".into(),
    });
    let ciphertext = group::encrypt(Some(&mesh_group), group::MessageType::Chat, &plaintext).unwrap();
    let packet = fluxon_core::codec::build_packet(
        fluxon_core::types::PacketType::Chat,
        identities[0].peer_id().unwrap(),
        fluxon_core::types::PeerId::BROADCAST,
        config.max_ttl,
        ciphertext,
        now_ms(),
    )
    .unwrap();
    relays[0].broadcast(packet, &identities[0]).await.unwrap();

    match tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv()).await {
        Ok(Ok(delivery)) => {
            let plaintext = group::decrypt(Some(&mesh_group), group::MessageType::Chat, &delivery.packet.payload).unwrap();
            let payload = fluxon_core::codec::decode_chat(&plaintext).unwrap();
            info!(text = %payload.text, "last device received message");
        }
        _ => info!("message did not reach the last device within the timeout"),
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
