//! # Tracer - CLI do Substrato de Trace
//!
//! Este é o **ponto de entrada** da linha de comando: a superfície que
//! operadores e CI usam para inspecionar, reexecutar e analisar runs
//! gravados por agentes instrumentados.
//!
//! ## O que este arquivo faz?
//!
//! 1. **Processa argumentos da linha de comando** (CLI) usando `clap`
//! 2. **Inicializa o sistema de telemetria** (console + OTEL opcional)
//! 3. **Despacha o subcomando** para o módulo do núcleo correspondente
//! 4. **Traduz o resultado em exit code** para integração com CI/CD
//!
//! ## Subcomandos e contratos de exit code:
//!
//! ```bash
//! tracer inspect <run_dir>            # 0 = run válido, 1 = falha
//! tracer replay <run_dir>             # 0 = zero divergências, 1 = divergiu
//! tracer analyze <run_dir>            # 0 sempre; diagnóstico no stdout
//! tracer test <run_dir> [asserts.json]# 0 = tudo passou, 1 = falhou
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};

use tracer::analysis;
use tracer::assertions;
use tracer::recorder::RecorderConfig;
use tracer::replay::ReplayEngine;
use tracer::store;
use tracer::telemetry::instrumentation::RunSpanContext;
use tracer::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tracer::validation;
use tracing::Instrument;

// ============================================================================
// DEFINIÇÃO DA CLI
// ============================================================================

/// Estrutura principal da CLI.
#[derive(Parser)]
#[command(name = "tracer")]
#[command(about = "Tracer - grava, reexecuta e analisa execuções de agentes", long_about = None)]
struct Cli {
    /// Subcomando a ser executado.
    #[command(subcommand)]
    command: Commands,
}

/// Flags comuns a todos os subcomandos.
#[derive(Args, Clone)]
struct CommonFlags {
    /// Modo silencioso: apenas erros críticos no stderr.
    ///
    /// Ideal para CI/CD onde só o exit code importa.
    #[arg(long, short = 's', default_value = "false")]
    silent: bool,

    /// Modo verbose: logs detalhados de debug.
    #[arg(long, short = 'v', default_value = "false")]
    verbose: bool,

    /// Habilita exportação de spans para OpenTelemetry.
    #[arg(long, default_value = "false")]
    otel: bool,

    /// Endpoint do collector OTEL (opcional).
    ///
    /// Se não especificado, usa `OTEL_EXPORTER_OTLP_ENDPOINT` ou
    /// `http://localhost:4317`.
    #[arg(long)]
    otel_endpoint: Option<String>,
}

/// Enum que define os subcomandos disponíveis.
#[derive(Subcommand)]
enum Commands {
    /// Carrega e valida um run gravado.
    ///
    /// Exit 0 quando o run é válido (parcial conta como válido);
    /// exit 1 em falha de carga ou violação de invariante.
    Inspect {
        /// Diretório do run.
        run_dir: PathBuf,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Reexecuta um run contra os próprios artefatos (zero efeitos).
    ///
    /// Exit 0 com zero divergências; exit 1 caso contrário.
    Replay {
        /// Diretório do run original.
        run_dir: PathBuf,

        /// Diretório raiz para o run de replay produzido.
        ///
        /// Padrão: `TRACER_TRACE_DIR` ou `./traces`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Analisa um run: checks, rótulos e causa raiz.
    ///
    /// Exit 0 sempre; o diagnóstico vai para o stdout.
    Analyze {
        /// Diretório do run.
        run_dir: PathBuf,

        /// Run de referência para alinhamento e ponto de divergência.
        #[arg(long)]
        baseline: Option<PathBuf>,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Avalia assertions contra um run.
    ///
    /// Sem arquivo de assertions, roda a validação de artefato e os
    /// checks de invariante padrão. Exit 0 se tudo passou.
    Test {
        /// Diretório do run.
        run_dir: PathBuf,

        /// Arquivo JSON de assertions (opcional).
        assertion_file: Option<PathBuf>,

        #[command(flatten)]
        common: CommonFlags,
    },
}

impl Commands {
    fn common(&self) -> &CommonFlags {
        match self {
            Commands::Inspect { common, .. }
            | Commands::Replay { common, .. }
            | Commands::Analyze { common, .. }
            | Commands::Test { common, .. } => common,
        }
    }
}

// ============================================================================
// FUNÇÃO PRINCIPAL
// ============================================================================

/// Ponto de entrada: telemetria, despacho, exit code.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let common = cli.command.common().clone();

    // Configura telemetria a partir do ambiente + flags.
    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if common.silent {
        Level::ERROR
    } else if common.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    if common.otel {
        if let Some(endpoint) = &common.otel_endpoint {
            telemetry_config.otlp_endpoint = Some(endpoint.clone());
        } else if telemetry_config.otlp_endpoint.is_none() {
            telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    }

    if let Err(e) = init_telemetry(telemetry_config) {
        if !common.silent {
            eprintln!("Warning: Failed to initialize telemetry: {}", e);
        }
        // Fallback: logging básico sem OTEL.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let code = match &cli.command {
        Commands::Inspect { run_dir, common } => run_inspect(run_dir, common.silent),
        Commands::Replay {
            run_dir,
            output,
            common,
        } => run_replay(run_dir, output.as_deref(), common.silent).await,
        Commands::Analyze {
            run_dir,
            baseline,
            common,
        } => run_analyze(run_dir, baseline.as_deref(), common.silent),
        Commands::Test {
            run_dir,
            assertion_file,
            common,
        } => run_test(run_dir, assertion_file.as_deref(), common.silent),
    };

    shutdown_telemetry();
    std::process::exit(code);
}

// ============================================================================
// SUBCOMANDO: INSPECT
// ============================================================================

/// Carrega, valida e resume um run. 0 = válido, 1 = inválido.
fn run_inspect(run_dir: &std::path::Path, silent: bool) -> i32 {
    let run = match store::load(run_dir) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to load run");
            return 1;
        }
    };

    let mut span = RunSpanContext::new("inspect", &run.meta.run_id);
    let code = span.in_scope(|| {
        if !silent {
            info!(run_id = %run.meta.run_id, steps = run.steps.len(), partial = run.partial, "Run loaded");
        }

        let violations = validation::validate_run(&run);

        if !silent {
            let summary = serde_json::json!({
                "run_id": run.meta.run_id,
                "status": run.meta.status,
                "steps": run.steps.len(),
                "partial": run.partial,
                "truncated": run.meta.truncated,
                "violations": violations.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
            });
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{}", json),
                Err(e) => error!(error = %e, "Failed to serialize summary"),
            }
        }

        if violations.is_empty() {
            if !silent {
                println!("✅ Run válido{}", if run.partial { " (parcial)" } else { "" });
            }
            0
        } else {
            for v in &violations {
                error!("  - {}", v);
            }
            if !silent {
                println!("❌ Run inválido: {} violação(ões)", violations.len());
            }
            1
        }
    });
    span.finish(run.steps.len());
    code
}

// ============================================================================
// SUBCOMANDO: REPLAY
// ============================================================================

/// Replay de identidade contra os artefatos. 0 = zero divergências.
async fn run_replay(
    run_dir: &std::path::Path,
    output: Option<&std::path::Path>,
    silent: bool,
) -> i32 {
    let source = match store::load(run_dir) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to load run");
            return 1;
        }
    };

    let mut span = RunSpanContext::new("replay", &source.meta.run_id);

    let mut config = RecorderConfig::from_env();
    if let Some(out) = output {
        config.base_dir = out.to_path_buf();
    }

    let engine = ReplayEngine::new(config);
    let report = match engine
        .replay_identity(&source)
        .instrument(span.tracing_span())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Replay failed");
            return 1;
        }
    };
    span.finish(report.steps_replayed);

    if !silent {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "Failed to serialize report"),
        }
    }

    if report.is_clean() {
        if !silent {
            println!("✅ Replay sem divergências ({} steps)", report.steps_replayed);
        }
        0
    } else {
        if !silent {
            println!("❌ {} divergência(s) detectada(s)", report.divergences.len());
        }
        1
    }
}

// ============================================================================
// SUBCOMANDO: ANALYZE
// ============================================================================

/// Análise de um run (e comparação opcional com baseline). Sempre 0.
fn run_analyze(
    run_dir: &std::path::Path,
    baseline: Option<&std::path::Path>,
    silent: bool,
) -> i32 {
    let run = match store::load(run_dir) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to load run");
            return 1;
        }
    };

    let mut span = RunSpanContext::new("analyze", &run.meta.run_id);
    let code = span.in_scope(|| {
        let report = analysis::analyze(&run);

        println!("--- Análise do run {} ---", report.run_id);
        if report.partial {
            println!("(run parcial: sem metadados terminais)");
        }

        println!("\nChecks de invariante:");
        for check in &report.checks {
            let mark = if check.passed { "pass" } else { "FAIL" };
            println!("  [{}] {}: {}", mark, check.name, check.detail);
        }

        if !report.labels.is_empty() {
            println!("\nRótulos semânticos:");
            for entry in &report.labels {
                let labels: Vec<String> = entry
                    .labels
                    .iter()
                    .filter_map(|l| serde_json::to_value(l).ok())
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                println!("  step {}: {}", entry.step_id, labels.join(", "));
            }
        }

        match &report.root_cause {
            Some(cause) => {
                println!("\nCausa raiz (confiança {:.1}):", cause.confidence);
                println!("  {}", cause.description);
            }
            None => println!("\nNenhum step com erro; sem causa raiz."),
        }

        if let Some(baseline_dir) = baseline {
            match store::load(baseline_dir) {
                Ok(other) => {
                    let comparison = analysis::compare(&run, &other);
                    println!("\n--- Comparação com {} ---", comparison.run_b);
                    match comparison.divergence_point {
                        Some(id) => println!("Ponto de divergência: step {}", id),
                        None => println!("Runs estruturalmente idênticos."),
                    }
                    for entry in &comparison.alignment {
                        println!(
                            "  posição {}: {:?} (A: {:?}, B: {:?})",
                            entry.index, entry.kind, entry.a_step, entry.b_step
                        );
                    }
                }
                Err(e) => error!(error = %e, "Failed to load baseline run"),
            }
        }

        if !silent {
            info!(run_id = %report.run_id, "Analysis finished");
        }
        0
    });
    span.finish(run.steps.len());
    code
}

// ============================================================================
// SUBCOMANDO: TEST
// ============================================================================

/// Validação + checks + assertions declarativas. 0 = tudo passou.
fn run_test(
    run_dir: &std::path::Path,
    assertion_file: Option<&std::path::Path>,
    silent: bool,
) -> i32 {
    let run = match store::load(run_dir) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to load run");
            return 1;
        }
    };

    let mut span = RunSpanContext::new("test", &run.meta.run_id);
    let code = span.in_scope(|| {
        let mut failures = 0usize;

        // 1. Validação estrutural do artefato.
        let violations = validation::validate_run(&run);
        for v in &violations {
            failures += 1;
            println!("[FAIL] artefato: {}", v);
        }

        // 2. Checks de invariante padrão.
        let report = analysis::analyze(&run);
        for check in &report.checks {
            let mark = if check.passed {
                "pass"
            } else {
                failures += 1;
                "FAIL"
            };
            println!("[{}] {}: {}", mark, check.name, check.detail);
        }

        // 3. Assertions declarativas, quando fornecidas.
        if let Some(path) = assertion_file {
            let parsed = match assertions::load_file(path) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "Failed to load assertion file");
                    return 1;
                }
            };
            for outcome in assertions::evaluate(&parsed, &run) {
                let mark = if outcome.passed {
                    "pass"
                } else {
                    failures += 1;
                    "FAIL"
                };
                println!("[{}] {}: {}", mark, outcome.name, outcome.detail);
            }
        }

        if failures == 0 {
            if !silent {
                println!("✅ Todas as verificações passaram");
            }
            0
        } else {
            if !silent {
                println!("❌ {} verificação(ões) falharam", failures);
            }
            1
        }
    });
    span.finish(run.steps.len());
    code
}
