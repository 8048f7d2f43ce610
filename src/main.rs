//! TCP proxy relay speaking one of two protocols per listener.
//!
//! 1. Shadowsocks: `./ss-relay -m ss -p 8000 -k <password> -e aes-256-gcm`
//! 2. Plain SOCKS5 with username/password: `./ss-relay -m socks5 -p 20032 -u <user> -k <password>`
//!
//! In Shadowsocks mode every connection opens with a cipher stream whose first plaintext bytes
//! are the destination header (`[atyp][addr][port]`, the same layout as a SOCKS5 request).
//! AEAD methods (`aes-128-gcm`, `aes-256-gcm`, `chacha20-ietf-poly1305`) send a random salt
//! followed by length-prefixed, individually authenticated chunks; the legacy `aes-*-cfb`
//! methods send an IV followed by an unauthenticated stream. Connections that fail to decrypt
//! or parse are closed without any reply.
//!
//! Without `-p` the listening port comes from the `SERVER_PORT` environment variable. Logging
//! goes through `env_logger`, `RUST_LOG` selects the level (`info` by default).

#![warn(rust_2018_idioms)]

use ::log::{error, info};
use anyhow::Context;
use futures::future::{self, Either, FutureExt};
use tokio::io;

use crate::command::{parse_command_line, Command};
use crate::socks5_node::{start_socks5_mode, Socks5Node};
use crate::ss_node::{start_ss_mode, SsNode};

mod command;
mod error;
mod server;
mod socks;
mod socks5_node;
mod ss_node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let serve = match parse_command_line() {
        Command::Shadowsocks(cfg) => {
            println!("Work in shadowsocks mode...");
            let node = SsNode::new(&cfg.password, &cfg.method, cfg.timeout)
                .with_context(|| format!("cannot use cipher method {}", cfg.method))?;
            start_ss_mode(cfg.listen_addr, node).boxed()
        }
        Command::Socks5(cfg) => {
            println!("Work in socks5 mode...");
            let node = Socks5Node::new(&cfg.username, &cfg.password, cfg.timeout);
            start_socks5_mode(cfg.listen_addr, node).boxed()
        }
    };

    match future::select(serve, tokio::signal::ctrl_c().boxed()).await {
        Either::Left((Err(e), _)) => {
            error!("Start server error: {:#}", e);
            return Err(e);
        }
        Either::Left((Ok(()), _)) => {}
        Either::Right((_, _)) => info!("Shutting down"),
    }
    Ok(())
}

fn other(desc: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, desc)
}
