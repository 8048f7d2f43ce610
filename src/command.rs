use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use structopt::StructOpt;

pub const SS_DEFAULT_PORT: u16 = 8000;
pub const SOCKS5_DEFAULT_PORT: u16 = 20032;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ss-relay",
    about = "TCP proxy relay speaking Shadowsocks or plain SOCKS5\n\
Client ---> ss-relay (ss: encrypted stream / socks5: username+password) ------> Destination\n\
Support two kind of command:\n\
1. Shadowsocks server:\n\
./ss-relay -m ss -p 8000 -k <password> -e aes-256-gcm\n\
2. SOCKS5 server:\n\
./ss-relay -m socks5 -p 20032 -u <username> -k <password>\n"
)]
pub struct Args {
    #[structopt(short = "m", long, help = "set working mode: ss or socks5")]
    mode: CommandMode,

    #[structopt(
        short = "l",
        long = "listenaddr",
        default_value = "0.0.0.0",
        help = "listen ip"
    )]
    listen_ip: IpAddr,

    #[structopt(
        short = "p",
        long,
        env = "SERVER_PORT",
        help = "listen port; falls back to SERVER_PORT, then 8000 for ss or 20032 for socks5"
    )]
    port: Option<u16>,

    #[structopt(
        short = "k",
        long,
        default_value = "qwe123",
        hide_default_value = true,
        help = "shadowsocks password or socks5 password"
    )]
    password: String,

    #[structopt(
        short = "e",
        long,
        default_value = "aes-256-gcm",
        help = "cipher: aes-128-gcm, aes-256-gcm, chacha20-ietf-poly1305, aes-128-cfb, aes-256-cfb"
    )]
    method: String,

    #[structopt(short = "u", long, default_value = "admin", help = "socks5 username")]
    username: String,

    #[structopt(
        short = "t",
        long,
        default_value = "300",
        help = "idle timeout in seconds"
    )]
    timeout: u64,
}

pub fn parse_command_line() -> Command {
    Args::from_args().into_command()
}

impl Args {
    fn into_command(self) -> Command {
        match self.mode {
            CommandMode::Shadowsocks => Command::Shadowsocks(SsConfig {
                listen_addr: SocketAddr::new(self.listen_ip, self.port.unwrap_or(SS_DEFAULT_PORT)),
                password: self.password,
                method: self.method,
                timeout: self.timeout,
            }),
            CommandMode::Socks5 => Command::Socks5(Socks5Config {
                listen_addr: SocketAddr::new(
                    self.listen_ip,
                    self.port.unwrap_or(SOCKS5_DEFAULT_PORT),
                ),
                username: self.username,
                password: self.password,
                timeout: self.timeout,
            }),
        }
    }
}

pub enum Command {
    Shadowsocks(SsConfig),
    Socks5(Socks5Config),
}

pub struct SsConfig {
    pub listen_addr: SocketAddr,
    pub password: String,
    pub method: String,
    pub timeout: u64,
}

pub struct Socks5Config {
    pub listen_addr: SocketAddr,
    pub username: String,
    pub password: String,
    pub timeout: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandMode {
    Shadowsocks,
    Socks5,
}

impl FromStr for CommandMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ss" | "shadowsocks" => Ok(CommandMode::Shadowsocks),
            "socks5" => Ok(CommandMode::Socks5),
            _ => Err("Unknow mode. Option should be ss or socks5"),
        }
    }
}
