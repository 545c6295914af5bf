use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rcxrpm_cli::{
    enumerate_processes, generate_token, inject_payload, process_name, MemoryProvider,
    RemoteProcessProvider, RpcSession, SessionCache, TargetSpec,
};
use rcxrpm_shared::Result;

#[derive(Parser)]
#[command(name = "rcxrpm")]
#[command(about = "Read and edit another process's memory over a shared-memory RPC channel")]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List processes this user could attach to
    List,
    /// Inject the agent into a process and print the target string
    Inject {
        /// Process ID to target
        #[arg(short, long)]
        pid: u32,
    },
    /// Liveness check against an injected agent
    Ping {
        /// Target string (rpm:<pid>:<token>:<name>)
        target: String,
    },
    /// Show the target's loaded modules
    Modules { target: String },
    /// Read memory and hexdump it
    Read {
        target: String,
        /// Address, hex (0x...) or decimal
        addr: String,
        /// Number of bytes
        len: u32,
    },
    /// Write bytes to target memory
    Write {
        target: String,
        /// Address, hex (0x...) or decimal
        addr: String,
        /// Bytes as a hex string, e.g. deadbeef
        bytes: String,
    },
    /// Ask the agent to tear down and unload
    Shutdown { target: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "rcxrpm_cli=info,rcxrpm_shared=info",
        1 => "rcxrpm_cli=debug,rcxrpm_shared=debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("RCXRPM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            for p in enumerate_processes() {
                match &p.path {
                    Some(path) => println!("{:>7}  {}  ({})", p.pid, p.name, path),
                    None => println!("{:>7}  {}", p.pid, p.name),
                }
            }
            Ok(())
        }
        Commands::Inject { pid } => {
            let token = generate_token();
            let guard = inject_payload(pid, &token)?;
            // Verify the agent came up before reporting success.
            let session = RpcSession::connect(pid, &token)?;
            drop(guard);
            session.ping()?;

            let spec = TargetSpec {
                pid,
                token,
                name: process_name(pid),
            };
            println!("{spec}");
            println!("image base: 0x{:x}", session.image_base());
            Ok(())
        }
        Commands::Ping { target } => {
            let provider = open_provider(&target)?;
            if provider.ping() {
                println!("agent in PID {} is alive", provider.pid());
                Ok(())
            } else {
                Err(rcxrpm_shared::Error::Disconnected)
            }
        }
        Commands::Modules { target } => {
            let provider = open_provider(&target)?;
            println!("image base: 0x{:x}", provider.image_base());
            for m in provider.modules() {
                println!("{:>18}  {:>10}  {}", format!("0x{:x}", m.base), m.size, m.name);
            }
            Ok(())
        }
        Commands::Read { target, addr, len } => {
            let provider = open_provider(&target)?;
            let addr = parse_addr(&addr)?;
            let mut buf = vec![0u8; len as usize];
            let clean = provider.read(addr, &mut buf);
            if !clean {
                eprintln!("(read incomplete; unreadable ranges are zero-filled)");
            }
            hexdump(addr, &buf);
            Ok(())
        }
        Commands::Write {
            target,
            addr,
            bytes,
        } => {
            let provider = open_provider(&target)?;
            let addr = parse_addr(&addr)?;
            let bytes = parse_hex_bytes(&bytes)?;
            if provider.write(addr, &bytes) {
                println!("wrote {} bytes at 0x{addr:x}", bytes.len());
                Ok(())
            } else {
                Err(rcxrpm_shared::Error::WriteRejected)
            }
        }
        Commands::Shutdown { target } => {
            let provider = open_provider(&target)?;
            provider.shutdown();
            println!("shutdown sent");
            Ok(())
        }
    }
}

fn open_provider(target: &str) -> Result<RemoteProcessProvider> {
    let spec = TargetSpec::parse(target)?;
    RemoteProcessProvider::open(Arc::new(SessionCache::new()), &spec)
}

fn parse_addr(s: &str) -> Result<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| rcxrpm_shared::Error::ProtocolError(format!("bad address {s:?}")))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() || s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(rcxrpm_shared::Error::ProtocolError(format!(
            "bad hex byte string {s:?}"
        )));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect())
}

fn hexdump(base: u64, bytes: &[u8]) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!(
            "{:016x}  {:<47}  |{}|",
            base + (row * 16) as u64,
            hex.join(" "),
            ascii
        );
    }
}
