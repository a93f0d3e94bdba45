//! Identity keypair generation tool.
//!
//! Generates a device's static Diffie-Hellman keypair and Ed25519 signing
//! keypair, derives its [`PeerId`], and writes both to a keystore directory
//! for later use by the mesh core.
//!
//! Usage:
//!   fluxon-keygen --name "field-node-1" --output ./keys/

use clap::Parser;
use ed25519_dalek::SigningKey;
use fluxon_core::PeerId;
use std::fs;
use std::path::PathBuf;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

#[derive(Parser)]
#[command(name = "fluxon-keygen", version, about = "FluxonApp identity keypair generator")]
struct Args {
    /// Device name (for documentation only, not embedded in the keys)
    #[arg(short, long)]
    name: String,

    /// Output directory for keys
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    println!("════════════════════════════════════════════════════════════");
    println!("  FluxonApp Identity Keypair Generator");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("Generating keypair for: {}", args.name);
    println!();

    let static_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let static_public = XPublicKey::from(&static_secret);
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

    use blake2::Digest;
    let mut hasher = blake2::Blake2b512::new();
    hasher.update(static_public.as_bytes());
    let digest = hasher.finalize();
    let mut peer_bytes = [0u8; 32];
    peer_bytes.copy_from_slice(&digest[..32]);
    let peer_id = PeerId(peer_bytes);

    fs::create_dir_all(&args.output).expect("failed to create output directory");

    let static_path = args.output.join(format!("{}_static_secret.key", args.name));
    fs::write(&static_path, static_secret.to_bytes()).expect("failed to write static secret");
    println!("Static DH secret saved to: {}", static_path.display());

    let signing_path = args.output.join(format!("{}_signing_key.key", args.name));
    fs::write(&signing_path, signing_key.to_bytes()).expect("failed to write signing key");
    println!("Signing key saved to: {}", signing_path.display());
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  Peer ID");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("{}", peer_id.to_hex());
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  SECURITY NOTE");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("Move {}_static_secret.key and {}_signing_key.key into the", args.name, args.name);
    println!("platform secure keystore and delete the files from disk.");
    println!("Never commit either key to version control.");
    println!();
}
