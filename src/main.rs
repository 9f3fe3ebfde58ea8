use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use edgenpu::backend::codegen::{ModelHeader, HEADER_SIZE};
use edgenpu::backend::isa::{Inst, FORMAT_WIDE};
use edgenpu::diagnostic::render_diagnostics;
use edgenpu::{compile, modeldef, CompileError, CompileOptions, NpuConfig, OptLevel};

#[derive(Parser)]
#[command(name = "edgenpu", version, about = "Neural network compiler for the EdgeNPU accelerator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a JSON model definition to an NPU binary.
    Compile {
        /// Model definition file.
        input: PathBuf,
        /// Output path; defaults to the input name with the target's extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Optimization level (0-3).
        #[arg(short = 'O', long, default_value_t = 2)]
        opt_level: u8,
        /// Run post-training INT8 quantization.
        #[arg(long)]
        quantize: bool,
        /// Emit the legacy compact instruction format.
        #[arg(long)]
        compact: bool,
        /// Hardware target name.
        #[arg(long, default_value = "edge16")]
        target: String,
        /// Also write the artifact as a C header at this path.
        #[arg(long)]
        header: Option<PathBuf>,
        /// Print optimization and artifact reports.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the header of a compiled artifact.
    Info {
        input: PathBuf,
    },
    /// Disassemble the instruction stream of a compiled artifact.
    Disasm {
        input: PathBuf,
    },
}

fn default_output(input: &Path, extension: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    let mut name = stem.to_os_string();
    name.push(extension);
    input.with_file_name(name)
}

#[allow(clippy::too_many_arguments)]
fn cmd_compile(
    input: PathBuf,
    output: Option<PathBuf>,
    opt_level: u8,
    quantize: bool,
    compact: bool,
    target: String,
    header: Option<PathBuf>,
    verbose: bool,
) -> Result<(), CompileError> {
    let target = NpuConfig::resolve(&target)?;
    let json = std::fs::read_to_string(&input)?;
    let def = modeldef::parse(&json)?;

    let model = if compact {
        modeldef::compile_compact(&def)?
    } else {
        let graph = modeldef::to_graph(&def)?;
        let options = CompileOptions {
            opt_level: OptLevel::from_u8(opt_level),
            quantize,
            target: target.clone(),
            ..Default::default()
        };
        let out = compile(graph, &options)?;
        render_diagnostics(&out.report.diagnostics);
        if verbose {
            println!("{}", out.report.format_report());
            println!("{}", out.schedule_report);
            println!("{}", out.memory_report);
        }
        out.model
    };

    if verbose {
        println!("{}", model.summary());
    }

    let output = output.unwrap_or_else(|| default_output(&input, &target.output_extension));
    model.save(&output)?;
    println!(
        "wrote {} ({} bytes, {} instructions)",
        output.display(),
        model.to_binary().len(),
        model.instruction_count
    );

    if let Some(path) = header {
        model.write_c_header(&path)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn cmd_info(input: PathBuf) -> Result<(), CompileError> {
    let bytes = std::fs::read(&input)?;
    let header = ModelHeader::parse(&bytes)?;
    println!("{}", input.display());
    println!("  format version: 0x{:04X}", header.version);
    println!("  layers: {}", header.layer_count);
    println!("  instructions: {}", header.instruction_count);
    println!("  weights: {} bytes", header.weight_size);
    println!("  input: {} bytes, output: {} bytes", header.input_size, header.output_size);
    println!("  payload: {} bytes, checksum 0x{:08X}", header.total_payload, header.checksum);
    Ok(())
}

fn cmd_disasm(input: PathBuf) -> Result<(), CompileError> {
    let bytes = std::fs::read(&input)?;
    let header = ModelHeader::parse(&bytes)?;
    if header.version != FORMAT_WIDE {
        return Err(CompileError::ModelDef(format!(
            "cannot disassemble format version 0x{:04X}",
            header.version
        )));
    }
    let start = HEADER_SIZE;
    let end = start + header.instruction_count as usize * 8;
    if bytes.len() < end {
        return Err(CompileError::ModelDef("instruction stream truncated".to_string()));
    }
    for (i, chunk) in bytes[start..end].chunks_exact(8).enumerate() {
        let word = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
        let inst = Inst::decode(word).map_err(CompileError::ModelDef)?;
        println!("{:4}: {}", i, inst);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), CompileError> {
    match cli.command {
        Command::Compile {
            input,
            output,
            opt_level,
            quantize,
            compact,
            target,
            header,
            verbose,
        } => cmd_compile(input, output, opt_level, quantize, compact, target, header, verbose),
        Command::Info { input } => cmd_info(input),
        Command::Disasm { input } => cmd_disasm(input),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
