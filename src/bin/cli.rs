//! Command line tool for shmkit IPC objects.
//!
//! Two surfaces behind one binary: `--ipc shmpool` manages shared memory
//! pool groups, `--ipc ringbuffer` manages ring buffer segments. Commands
//! take properties as repeated `-p key=value` arguments.

use shmkit::pool::ShmPool;
use shmkit::ring::{PageSize, RingBuffer, RingBufferAttr};
use shmkit::vaw::{VirtualAddressWindow, MIN_POOL_SIZE};
use shmkit::{Error, Result};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HELP: &str = "\
shmkit IPC cli tool
===================
Usage: shmkit-cli [options]
--(i)pc <type>         specifies the ipc type to control. (mandatory)
                       type:=shmpool|ringbuffer
--(c)md <command>      specifies the command to execute. (mandatory)
                       shmpool:    create_group|remove_group|activate
                       ringbuffer: create|show|delete|perf
--(p)roperty <p=val>   specify a property for the command. Multiple
                       --property entries are allowed.
--(h)elp               print this information.

shmpool properties:
  group:=<group name>                                   (mandatory)
  psize:=<pool size in bytes>         [activate, default min pool size]
  dsize:=<data block size in bytes>   [activate, default 1 MB]

ringbuffer properties:
  key:=<ring buffer key>              [show/delete/perf mandatory]
  page_size:=4K|2M|1G                 [create, default 4K]
  capacity:=<# of entries>            [create, power of two, default 4096]
  entry_size:=<bytes>                 [create, power of two, default 64]
  multiple_producers:=0|1             [create, default 0]
  multiple_consumers:=0|1             [create, default 0]
  description:=<string>               [create, up to 255 bytes]
  role:=producer|consumer             [perf mandatory]
  size:=<message size>                [perf, default entry size]
  wcount:=<# of warmup messages>      [perf, default 1000]
  rcount:=<# of timed messages>       [perf, default 10000]
";

type Properties = HashMap<String, String>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut ipc = String::new();
    let mut cmd = String::new();
    let mut props = Properties::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ipc" | "-i" => ipc = required_value(&arg, args.next())?,
            "--cmd" | "-c" => cmd = required_value(&arg, args.next())?,
            "--property" | "-p" => {
                let kv = required_value(&arg, args.next())?;
                let (k, v) = kv.split_once('=').ok_or_else(|| {
                    Error::InvalidArgument(format!("property {kv:?} is not of the form key=value"))
                })?;
                props.insert(k.to_string(), v.to_string());
            }
            "--help" | "-h" => {
                print!("{HELP}");
                return Ok(());
            }
            other => {
                return Err(Error::InvalidArgument(format!("unknown argument {other:?}")));
            }
        }
    }

    if ipc.is_empty() || cmd.is_empty() {
        print!("{HELP}");
        return Ok(());
    }

    match (ipc.as_str(), cmd.as_str()) {
        ("shmpool", "create_group") => {
            let group = required_prop(&props, "group")?;
            VirtualAddressWindow::create(group)?;
            println!("Shared memory pool group:{group} created.");
            Ok(())
        }
        ("shmpool", "remove_group") => {
            let group = required_prop(&props, "group")?;
            VirtualAddressWindow::remove(group)?;
            println!("Shared memory pool group:{group} removed.");
            Ok(())
        }
        ("shmpool", "activate") => shmpool_activate(&props),
        ("ringbuffer", "create") => ringbuffer_create(&props),
        ("ringbuffer", "show") => ringbuffer_show(&props),
        ("ringbuffer", "delete") => {
            let key = parse_key(required_prop(&props, "key")?)?;
            RingBuffer::delete(key)?;
            println!("RingBuffer with key={key:#x} is deleted.");
            Ok(())
        }
        ("ringbuffer", "perf") => ringbuffer_perf(&props),
        (ipc, cmd) => Err(Error::InvalidArgument(format!(
            "unknown command {cmd:?} for ipc type {ipc:?}"
        ))),
    }
}

fn required_value(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| Error::InvalidArgument(format!("{flag} requires a value")))
}

fn required_prop<'p>(props: &'p Properties, key: &str) -> Result<&'p str> {
    props.get(key).map(String::as_str).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "mandatory {key:?} property is not found, specify it with '-p {key}=<value>'"
        ))
    })
}

/// Parse a decimal or `0x`-prefixed integer property.
fn parse_u64(name: &str, value: &str) -> Result<u64> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| Error::InvalidArgument(format!("{name}={value:?} is not an integer")))
}

fn parse_key(value: &str) -> Result<i32> {
    Ok(parse_u64("key", value)? as i32)
}

fn shmpool_activate(props: &Properties) -> Result<()> {
    let group = required_prop(props, "group")?;
    let pool_size = match props.get("psize") {
        Some(v) => parse_u64("psize", v)?,
        None => MIN_POOL_SIZE,
    };
    if let Some(v) = props.get("dsize") {
        // Accepted for interface compatibility; activation only reserves.
        parse_u64("dsize", v)?;
    }

    VirtualAddressWindow::initialize(group)?;
    let pool = ShmPool::create(pool_size)?;
    println!("Pool Allocated with:");
    println!("capacity: {:#x}", pool.capacity());
    println!("offset:   {:#x}", pool.offset());
    println!("vaddr:    {:#x}", pool.vaddr());
    println!("Press ENTER to continue.");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    drop(pool);
    println!("Pool released.");
    VirtualAddressWindow::uninitialize();
    Ok(())
}

fn ringbuffer_create(props: &Properties) -> Result<()> {
    let mut attr = RingBufferAttr::default();

    if let Some(v) = props.get("key") {
        attr.key = parse_key(v)?;
    }
    if attr.key == 0 {
        // Pick a non-zero key so other processes can look the buffer up.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        attr.key = ((std::process::id() ^ nanos) & 0x7fff_ffff).max(1) as i32;
    }
    if let Some(v) = props.get("page_size") {
        attr.page_size = match v.as_str() {
            "4K" => PageSize::Default,
            "2M" => PageSize::Huge2M,
            "1G" => PageSize::Huge1G,
            other => {
                return Err(Error::InvalidArgument(format!("unknown page size {other:?}")));
            }
        };
    }
    if let Some(v) = props.get("capacity") {
        attr.capacity = parse_u64("capacity", v)? as u32;
    }
    if let Some(v) = props.get("entry_size") {
        attr.entry_size = parse_u64("entry_size", v)? as u16;
    }
    attr.multiple_producer = parse_flag(props, "multiple_producers")?;
    attr.multiple_consumer = parse_flag(props, "multiple_consumers")?;
    if let Some(v) = props.get("description") {
        attr.description = v.clone();
    }

    let key = RingBuffer::create(&attr)?;
    println!("A ring buffer is created with key = {key:#x}");
    Ok(())
}

fn parse_flag(props: &Properties, key: &str) -> Result<bool> {
    match props.get(key).map(String::as_str) {
        None | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(Error::InvalidArgument(format!(
            "unknown {key} setting {other:?}, expected 0 or 1"
        ))),
    }
}

fn ringbuffer_show(props: &Properties) -> Result<()> {
    let key = parse_key(required_prop(props, "key")?)?;
    let rb = RingBuffer::attach(key)?;
    let attr = rb.attribute();
    println!("key:          {:#x}", attr.key);
    println!("id:           {}", attr.id);
    println!("page_size:    {} KB", attr.page_size.bytes() / 1024);
    println!("capacity:     {}", attr.capacity);
    println!("entry_size:   {} Bytes", attr.entry_size);
    println!("multiple_producer:    {}", attr.multiple_producer);
    println!("multiple_consumer:    {}", attr.multiple_consumer);
    println!("description:  {}", attr.description);
    println!("current size: {}", rb.len());
    Ok(())
}

/// Nanoseconds on the monotonic clock, comparable across processes.
fn monotonic_ns() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn ringbuffer_perf(props: &Properties) -> Result<()> {
    let key = parse_key(required_prop(props, "key")?)?;
    let role = required_prop(props, "role")?;

    let rb = Arc::new(RingBuffer::attach(key)?);
    let attr = rb.attribute();

    let message_size = match props.get("size") {
        Some(v) => parse_u64("size", v)? as usize,
        None => attr.entry_size as usize,
    };
    if message_size == 0 || message_size > attr.entry_size as usize {
        return Err(Error::InvalidArgument(format!(
            "message size {message_size} must be in [1, {}]",
            attr.entry_size
        )));
    }
    let wcount = match props.get("wcount") {
        Some(v) => parse_u64("wcount", v)?,
        None => 1000,
    };
    let rcount = match props.get("rcount") {
        Some(v) => parse_u64("rcount", v)?,
        None => 10000,
    };

    match role {
        "producer" => {
            let mut buffer = vec![0u8; message_size];
            // Warmup messages carry a zero timestamp, which disables
            // latency evaluation on the consumer side.
            for _ in 0..wcount {
                rb.produce(&buffer, Duration::from_secs(60))?;
            }
            for _ in 0..rcount {
                if message_size >= 8 {
                    buffer[..8].copy_from_slice(&monotonic_ns().to_le_bytes());
                }
                rb.produce(&buffer, Duration::from_secs(60))?;
            }
            Ok(())
        }
        "consumer" => {
            let stop = Arc::new(AtomicBool::new(false));
            let consumer = {
                let rb = Arc::clone(&rb);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || -> Result<Vec<u64>> {
                    let mut buffer = vec![0u8; message_size];
                    let mut latencies_ns = Vec::new();
                    while !stop.load(Ordering::Relaxed) {
                        match rb.consume(&mut buffer, Duration::from_secs(1)) {
                            Ok(()) => {}
                            Err(Error::Timeout(_)) => continue,
                            Err(e) => return Err(e),
                        }
                        if message_size >= 8 {
                            let sts = u64::from_le_bytes(buffer[..8].try_into().unwrap());
                            if sts != 0 {
                                latencies_ns.push(monotonic_ns().saturating_sub(sts));
                            }
                        }
                    }
                    Ok(latencies_ns)
                })
            };

            eprintln!("Press ENTER to finish.");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            stop.store(true, Ordering::Relaxed);

            let latencies = consumer
                .join()
                .map_err(|_| Error::InvalidArgument("consumer thread panicked".to_string()))??;
            for lat in latencies {
                println!("{lat}");
            }
            Ok(())
        }
        other => Err(Error::InvalidArgument(format!(
            "unknown role {other:?}, expected producer or consumer"
        ))),
    }
}
