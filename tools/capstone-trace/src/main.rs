//! capstone-trace - replay request traces against the node controller
//!
//! Commands:
//! - `capstone-trace run <file>` - Run a trace file against a fresh controller
//! - `capstone-trace grammar` - Show the trace file grammar
//!
//! A trace is a plain-text script of controller commands. The tool wires a
//! controller to the scriptable memory model, feeds the script through the
//! CPU link (or the raw frame codec with `--raw`), and prints every
//! response as it surfaces.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;

use capstone_controller::{CpuLink, MemLink, NodeController, NodeControllerConfig};
use capstone_mem_model::{MemModelConfig, MemoryModel};
use capstone_node_table::{Bounds, Derivation, NodeHandle};
use capstone_protocol::{
    wire, Command, Request, RequestTag, RequesterId, Response, ResponseBody,
};

/// Give up on a response after this many ticks
const MAX_SETTLE_TICKS: usize = 10_000;

#[derive(Parser)]
#[command(name = "capstone-trace")]
#[command(author = "Capstone Project Developers")]
#[command(version)]
#[command(about = "Replay request traces against the node controller model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a trace file
    Run {
        /// Trace file path
        file: PathBuf,

        /// Route every request through the raw frame codec
        #[arg(long)]
        raw: bool,

        /// Node table capacity in slots
        #[arg(long, default_value_t = 1024)]
        capacity: usize,

        /// Revocation walk budget per tick
        #[arg(long, default_value_t = 8)]
        budget: usize,

        /// Memory timeout in ticks; 0 waits forever
        #[arg(long, default_value_t = 64)]
        timeout: u64,

        /// Memory latency in ticks
        #[arg(long, default_value_t = 1)]
        latency: u64,

        /// Memory answers youngest-first
        #[arg(long)]
        reorder: bool,

        /// Skip the closing statistics block
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show the trace file grammar
    Grammar,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            raw,
            capacity,
            budget,
            timeout,
            latency,
            reorder,
            quiet,
        } => {
            let mut config = NodeControllerConfig::with_capacity(capacity).revoke_budget(budget);
            if timeout > 0 {
                config = config.mem_timeout(timeout);
            }
            let model_config = MemModelConfig {
                latency,
                reorder,
                black_holes: Vec::new(),
            };
            run_trace(&file, raw, config, model_config, quiet)?;
        }

        Commands::Grammar => {
            show_grammar();
        }
    }

    Ok(())
}

fn run_trace(
    file: &Path,
    raw: bool,
    config: NodeControllerConfig,
    model_config: MemModelConfig,
    quiet: bool,
) -> anyhow::Result<()> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("reading trace file '{}'", file.display()))?;
    log::debug!(
        "controller config {:?}, memory latency {} reorder {}",
        config,
        model_config.latency,
        model_config.reorder
    );

    println!(
        "{} Running trace '{}'{}...",
        "▶".green(),
        file.display(),
        if raw { " through the frame codec" } else { "" }
    );

    let mut runner = Runner::new(config, model_config, raw);
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let stripped = line.split('#').next().unwrap_or("").trim();
        if stripped.is_empty() {
            continue;
        }
        runner
            .exec_line(line_no, stripped)
            .with_context(|| format!("line {}: '{}'", line_no, stripped))?;
    }
    runner.drain()?;

    if runner.errors == 0 {
        println!(
            "\n{} Trace complete: {} commands",
            "✅".green(),
            runner.commands
        );
    } else {
        println!(
            "\n{} Trace complete: {} commands, {} answered with errors",
            "❌".red(),
            runner.commands,
            runner.errors
        );
    }
    if !quiet {
        runner.show_stats();
    }
    Ok(())
}

/// Controller, memory model and script state wired together
struct Runner {
    controller: NodeController,
    cpu: CpuLink,
    mem: MemLink,
    model: MemoryModel,
    raw: bool,
    requester: u32,
    next_tag: u64,
    names: HashMap<String, NodeHandle>,
    pending: HashMap<u64, String>,
    commands: usize,
    errors: usize,
}

impl Runner {
    fn new(config: NodeControllerConfig, model_config: MemModelConfig, raw: bool) -> Self {
        let (controller, cpu, mem) = NodeController::connect(config);
        Self {
            controller,
            cpu,
            mem,
            model: MemoryModel::new(model_config),
            raw,
            requester: 0,
            next_tag: 0,
            names: HashMap::new(),
            pending: HashMap::new(),
            commands: 0,
            errors: 0,
        }
    }

    fn exec_line(&mut self, line_no: usize, line: &str) -> anyhow::Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (wait_for_answer, tokens) = match tokens.split_first() {
            Some((&"post", rest)) if !rest.is_empty() => (false, rest),
            _ => (true, &tokens[..]),
        };

        match tokens {
            ["requester", id] => {
                self.requester = parse_u64(id)? as u32;
                Ok(())
            }
            ["wait", ticks] => {
                let ticks = parse_u64(ticks)? as usize;
                for _ in 0..ticks {
                    for response in self.tick() {
                        self.print_arrival(&response);
                    }
                }
                Ok(())
            }
            ["derive", name, "root"] => self.run_derive(line_no, line, name, None, Derivation::Branch, wait_for_answer),
            ["derive", name, "branch", parent] => {
                let parent = self.node(parent)?;
                self.run_derive(line_no, line, name, Some(parent), Derivation::Branch, wait_for_answer)
            }
            ["derive", name, "leaf", parent, base, len] => {
                let parent = self.node(parent)?;
                let bounds = Bounds::new(parse_u64(base)?, parse_u64(len)?);
                self.run_derive(line_no, line, name, Some(parent), Derivation::Leaf { bounds }, wait_for_answer)
            }
            ["revoke", node] => {
                let node = self.node(node)?;
                self.run_command(line_no, line, Command::Revoke { node }, wait_for_answer)
            }
            ["query", node] => {
                let node = self.node(node)?;
                self.run_command(line_no, line, Command::Query { node }, wait_for_answer)
            }
            ["unlink", node] => {
                let node = self.node(node)?;
                self.run_command(line_no, line, Command::Unlink { node }, wait_for_answer)
            }
            ["rcupdate", node, delta] => {
                let node = self.node(node)?;
                let delta: i32 = delta.parse().context("refcount delta")?;
                self.run_command(line_no, line, Command::RcUpdate { node, delta }, wait_for_answer)
            }
            ["read", addr, size] => {
                let command = Command::MemRead {
                    addr: parse_u64(addr)?,
                    size: parse_u64(size)? as u32,
                };
                self.run_command(line_no, line, command, wait_for_answer)
            }
            ["write", addr, bytes] => {
                let command = Command::MemWrite {
                    addr: parse_u64(addr)?,
                    data: parse_hex_bytes(bytes)?,
                };
                self.run_command(line_no, line, command, wait_for_answer)
            }
            _ => bail!("unknown command"),
        }
    }

    fn run_derive(
        &mut self,
        line_no: usize,
        line: &str,
        name: &str,
        parent: Option<NodeHandle>,
        derivation: Derivation,
        wait_for_answer: bool,
    ) -> anyhow::Result<()> {
        if !wait_for_answer {
            bail!("derive binds a name and cannot be posted");
        }
        let tag = self.send(line_no, line, Command::Derive { parent, derivation })?;
        let response = self.settle(tag)?;
        if let ResponseBody::Handle(handle) = response.body {
            self.names.insert(name.to_string(), handle);
        }
        self.print_arrival(&response);
        Ok(())
    }

    fn run_command(
        &mut self,
        line_no: usize,
        line: &str,
        command: Command,
        wait_for_answer: bool,
    ) -> anyhow::Result<()> {
        let tag = self.send(line_no, line, command)?;
        if wait_for_answer {
            let response = self.settle(tag)?;
            self.print_arrival(&response);
        }
        Ok(())
    }

    fn send(&mut self, line_no: usize, line: &str, command: Command) -> anyhow::Result<RequestTag> {
        self.next_tag += 1;
        let tag = RequestTag(self.next_tag);
        let request = Request::new(tag, RequesterId(self.requester), command);
        if self.raw {
            self.controller.submit_frame(&wire::encode_request(&request));
        } else if self.cpu.try_send(request).is_err() {
            bail!("CPU link full");
        }
        self.pending.insert(tag.0, format!("{:>4}  {}", line_no, line));
        self.commands += 1;
        Ok(tag)
    }

    /// One controller cycle with the memory model serviced behind it
    fn tick(&mut self) -> Vec<Response> {
        self.controller.tick();
        for request in self.mem.drain() {
            self.model.handle(request);
        }
        for response in self.model.tick() {
            let _ = self.mem.try_send(response);
        }
        self.cpu.drain()
    }

    /// Tick until `want`'s answer arrives; prints everything else on the way
    fn settle(&mut self, want: RequestTag) -> anyhow::Result<Response> {
        for _ in 0..MAX_SETTLE_TICKS {
            let mut target = None;
            for response in self.tick() {
                if response.tag == want {
                    target = Some(response);
                } else {
                    self.print_arrival(&response);
                }
            }
            if let Some(response) = target {
                return Ok(response);
            }
        }
        bail!("no response after {} ticks", MAX_SETTLE_TICKS);
    }

    /// Collect every response still owed after the script ends
    fn drain(&mut self) -> anyhow::Result<()> {
        for _ in 0..MAX_SETTLE_TICKS {
            if self.pending.is_empty() {
                return Ok(());
            }
            for response in self.tick() {
                self.print_arrival(&response);
            }
        }
        bail!("{} responses never arrived", self.pending.len());
    }

    fn print_arrival(&mut self, response: &Response) {
        let label = self
            .pending
            .remove(&response.tag.0)
            .unwrap_or_else(|| format!("   ?  tag {}", response.tag.0));
        let rendered = match &response.body {
            ResponseBody::Handle(handle) => format!("node {}:{}", handle.index(), handle.generation())
                .green()
                .to_string(),
            ResponseBody::Validity(true) => "valid".green().to_string(),
            ResponseBody::Validity(false) => "invalid".yellow().to_string(),
            ResponseBody::RefCount(count) => format!("refcount {}", count),
            ResponseBody::Ack => "ok".green().to_string(),
            ResponseBody::Data(bytes) => render_bytes(bytes),
            ResponseBody::Error(code) => {
                self.errors += 1;
                format!("error: {}", code).red().to_string()
            }
        };
        println!("{}  ->  {}", label, rendered);
    }

    fn show_stats(&self) {
        let stats = self.controller.stats();
        let store = self.controller.store_stats();
        println!("\nController after {} ticks:", self.controller.now());
        println!("  nodes live        {:>8}  of {}", store.live, store.capacity);
        println!("  allocated/freed   {:>8}  / {}", store.total_allocated, store.total_freed);
        println!("  derives           {:>8}", stats.derives);
        println!("  revokes           {:>8}  ({} nodes, {} reclaimed)", stats.revokes, stats.nodes_revoked, stats.nodes_freed);
        println!("  queries           {:>8}", stats.queries);
        println!("  unlinks           {:>8}", stats.unlinks);
        println!("  rc updates        {:>8}", stats.rc_updates);
        println!("  node op errors    {:>8}", stats.node_op_errors);
        println!("  malformed         {:>8}", stats.malformed_requests);
        println!(
            "  pass-through      {:>8}  issued, {} completed, {} timed out, {} late",
            stats.passthrough_issued,
            stats.passthrough_completed,
            stats.passthrough_timed_out,
            stats.passthrough_late_dropped
        );
    }

    fn node(&self, name: &str) -> anyhow::Result<NodeHandle> {
        self.names
            .get(name)
            .copied()
            .with_context(|| format!("unknown node name '{}'", name))
    }
}

fn parse_u64(text: &str) -> anyhow::Result<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.with_context(|| format!("bad number '{}'", text))
}

fn parse_hex_bytes(text: &str) -> anyhow::Result<Vec<u8>> {
    if !text.is_ascii() || text.len() % 2 != 0 || text.is_empty() {
        bail!("hex byte string '{}' must be an even number of hex digits", text);
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .with_context(|| format!("bad hex byte in '{}'", text))
        })
        .collect()
}

fn render_bytes(bytes: &[u8]) -> String {
    let shown: Vec<String> = bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    if bytes.len() > 16 {
        format!("{} .. ({} bytes)", shown.join(" "), bytes.len())
    } else {
        shown.join(" ")
    }
}

fn show_grammar() {
    println!(
        "Trace files are plain text, one command per line; '#' starts a comment.

  requester <id>                    switch the issuing requester (default 0)
  derive <name> root                create a tree root, bind it to <name>
  derive <name> branch <parent>     derive a branch under <parent>
  derive <name> leaf <parent> <base> <len>
                                    derive a leaf covering [base, base+len)
  revoke <node>                     invalidate <node>'s whole subtree
  query <node>                      report the validity flag
  unlink <node>                     detach <node> from its parent
  rcupdate <node> <delta>           adjust the reference count
  read <addr> <size>                pass-through memory read
  write <addr> <hexbytes>           pass-through memory write
  wait <ticks>                      let the clock run
  post <command>                    issue without waiting for the answer

Numbers accept decimal or 0x-prefixed hex. Node operands are names bound
by an earlier derive."
    );
}
