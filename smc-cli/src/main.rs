use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use smc_core::marshal::float_repr;
use smc_core::{OpcodeMap, Value, dumps, loads_prefix, redirect, unredirect};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "smc-cli")]
#[command(about = "Game script (un)redirect and object graph tool – CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Log each framing and codec stage to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decrypt a script file to its payload
    Redirect {
        /// Path to the obfuscated script file
        input: PathBuf,

        /// Path to write the decrypted payload
        output: PathBuf,
    },

    /// Encrypt a payload into a script file
    Unredirect {
        /// Path to the payload file
        input: PathBuf,

        /// Path to write the obfuscated script file
        output: PathBuf,
    },

    /// Print the object graph stored in a payload
    Inspect {
        /// Path to a file holding a serialized object graph
        input: PathBuf,

        /// Number of leading container bytes to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Re-encode an object graph with remapped opcodes
    Remap {
        /// Path to a file holding a serialized object graph
        input: PathBuf,

        /// JSON object of "from": to opcode pairs
        opmap: PathBuf,

        /// Path to write the re-encoded file
        output: PathBuf,

        /// Number of leading container bytes to copy through unchanged
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Redirect { input, output } => {
            cmd_redirect(&input, &output)?;
        }
        Commands::Unredirect { input, output } => {
            cmd_unredirect(&input, &output)?;
        }
        Commands::Inspect { input, offset } => {
            print!("{}", cmd_inspect(&input, offset)?);
        }
        Commands::Remap {
            input,
            opmap,
            output,
            offset,
        } => {
            cmd_remap(&input, &opmap, &output, offset)?;
        }
    }

    Ok(())
}

fn cmd_redirect(input: &Path, output: &Path) -> Result<()> {
    let data = fs::read(input)
        .with_context(|| format!("Failed to read script file: {}", input.display()))?;

    println!("[info] len(script)={}", data.len());

    let payload = redirect(&data).context("Failed to decrypt script")?;

    fs::write(output, &payload)
        .with_context(|| format!("Failed to write payload file: {}", output.display()))?;

    println!("[ok] wrote payload ({} bytes) -> {}", payload.len(), output.display());

    Ok(())
}

fn cmd_unredirect(input: &Path, output: &Path) -> Result<()> {
    let payload = fs::read(input)
        .with_context(|| format!("Failed to read payload file: {}", input.display()))?;

    let script = unredirect(&payload).context("Failed to encrypt payload")?;

    fs::write(output, &script)
        .with_context(|| format!("Failed to write script file: {}", output.display()))?;

    println!("[ok] wrote script ({} bytes) -> {}", script.len(), output.display());

    Ok(())
}

/// Decode the value at `offset`, returning it with the bytes before it
fn read_graph(input: &Path, offset: usize) -> Result<(Vec<u8>, Value)> {
    let data = fs::read(input)
        .with_context(|| format!("Failed to read payload file: {}", input.display()))?;

    if offset > data.len() {
        bail!("offset {} is past the end of a {} byte file", offset, data.len());
    }

    let (header, body) = data.split_at(offset);
    let (value, used) = loads_prefix(body)
        .with_context(|| format!("Failed to decode object graph at offset {}", offset))?;

    println!("[info] decoded {} bytes at offset {}", used, offset);
    if used < body.len() {
        eprintln!("[warn] {} trailing bytes after the object graph", body.len() - used);
    }

    Ok((header.to_vec(), value))
}

fn cmd_inspect(input: &Path, offset: usize) -> Result<String> {
    let (_, value) = read_graph(input, offset)?;
    Ok(render(&value))
}

fn cmd_remap(input: &Path, opmap: &Path, output: &Path, offset: usize) -> Result<()> {
    let text = fs::read_to_string(opmap)
        .with_context(|| format!("Failed to read opcode map: {}", opmap.display()))?;
    let pairs: BTreeMap<u8, u8> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse opcode map: {}", opmap.display()))?;
    println!("[info] loaded {} opcode pairs", pairs.len());
    let map: OpcodeMap = pairs.into_iter().collect();

    let (mut out, value) = read_graph(input, offset)?;
    if count_code(&value) == 0 {
        eprintln!("[warn] no code objects found, nothing to remap");
    }

    out.extend(dumps(&value, Some(&map)).context("Failed to encode object graph")?);

    fs::write(output, &out)
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    println!("[ok] wrote remapped graph -> {}", output.display());

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn count_code(value: &Value) -> usize {
    match value {
        Value::Code(code) => 1 + count_code(&code.consts),
        Value::Tuple(items) | Value::List(items) => items.iter().map(count_code).sum(),
        Value::Dict(map) => map.iter().map(|(k, v)| count_code(k) + count_code(v)).sum(),
        Value::Set(set) | Value::FrozenSet(set) => set.iter().map(count_code).sum(),
        _ => 0,
    }
}

/// Indented one-line-per-node listing of an object graph
fn render(value: &Value) -> String {
    let mut out = String::new();
    render_into(value, 0, &mut out);
    out
}

fn render_into(value: &Value, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Code(code) => {
            out.push_str(&format!(
                "{pad}code {} ({}) line {}\n",
                text_of(&code.name),
                text_of(&code.filename),
                code.firstlineno
            ));
            out.push_str(&format!(
                "{pad}  argcount={} nlocals={} stacksize={} flags=0x{:04x} code={} bytes\n",
                code.argcount,
                code.nlocals,
                code.stacksize,
                code.flags,
                code.code.len()
            ));
            for (label, names) in [
                ("names", &code.names),
                ("varnames", &code.varnames),
                ("freevars", &code.freevars),
                ("cellvars", &code.cellvars),
            ] {
                let names = names.as_seq().unwrap_or_default();
                if !names.is_empty() {
                    let joined: Vec<String> = names.iter().map(text_of).collect();
                    out.push_str(&format!("{pad}  {label}: {}\n", joined.join(", ")));
                }
            }
            let consts = code.consts.as_seq().unwrap_or_default();
            if !consts.is_empty() {
                out.push_str(&format!("{pad}  consts:\n"));
                for c in consts {
                    render_into(c, depth + 2, out);
                }
            }
        }
        Value::Tuple(items) | Value::List(items) => {
            out.push_str(&format!("{pad}{} [{}]\n", value.kind_name(), items.len()));
            for item in items {
                render_into(item, depth + 1, out);
            }
        }
        Value::Set(set) | Value::FrozenSet(set) => {
            out.push_str(&format!("{pad}{} [{}]\n", value.kind_name(), set.len()));
            for item in set {
                render_into(item, depth + 1, out);
            }
        }
        Value::Dict(map) => {
            out.push_str(&format!("{pad}dict [{}]\n", map.len()));
            for (k, v) in map {
                render_into(k, depth + 1, out);
                render_into(v, depth + 2, out);
            }
        }
        leaf => out.push_str(&format!("{pad}{}\n", leaf_text(leaf))),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Bytes(b) | Value::Interned(b) => String::from_utf8_lossy(b).into_owned(),
        other => other.kind_name().to_string(),
    }
}

fn leaf_text(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::Long(l) => match l.to_i128() {
            Some(v) => format!("{v}L"),
            None => format!("long ({} digits)", l.digits().len()),
        },
        Value::Float(f) => float_repr(*f),
        Value::Complex(re, im) => format!("({}+{}j)", float_repr(*re), float_repr(*im)),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => format!("{s:?}"),
        Value::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(b)),
        Value::Interned(b) => format!("interned {:?}", String::from_utf8_lossy(b)),
        other => other.kind_name().to_string(),
    }
}
