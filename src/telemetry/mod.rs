//! # Módulo de Telemetria OpenTelemetry
//!
//! Observabilidade do próprio tracer: logging estruturado no console e,
//! quando configurado, exportação de spans OTLP das operações da CLI
//! (inspect, replay, analyze, test).
//!
//! ## Para todos entenderem:
//!
//! O tracer grava a execução de agentes; a telemetria grava a execução
//! DO TRACER. São camadas diferentes:
//! - o artefato de trace é o produto (fica em disco, é analisável)
//! - os spans OTEL são operacionais (latência de replay, erros de I/O)
//!
//! Os dados podem ser visualizados em ferramentas como:
//! - Jaeger
//! - Zipkin
//! - Grafana Tempo
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `OTEL_SERVICE_NAME`: Nome do serviço
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP
//! - `OTEL_TRACES_SAMPLER_ARG`: Taxa de sampling (0.0-1.0)
//!
//! ## Exemplo de uso:
//!
//! ```ignore
//! let config = TelemetryConfig {
//!     service_name: "tracer".to_string(),
//!     otlp_endpoint: Some("http://localhost:4317".to_string()),
//!     ..Default::default()
//! };
//!
//! init_telemetry(config)?;
//!
//! // ... replay, análise ...
//!
//! shutdown_telemetry(); // Flush dos dados
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração do sistema de telemetria.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Nome do serviço para identificação nos traces.
    pub service_name: String,

    /// Endpoint OTLP para envio de spans (gRPC).
    /// Se None, apenas loga para console.
    pub otlp_endpoint: Option<String>,

    /// Taxa de sampling (0.0 a 1.0).
    pub sampling_ratio: f64,

    /// Se deve habilitar logging para console.
    pub enable_console_logging: bool,

    /// Nível de log mínimo (INFO, DEBUG, WARN, ERROR).
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tracer".to_string(),
            otlp_endpoint: None, // Sem OTLP por padrão
            sampling_ratio: 1.0, // 100% por padrão
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Cria configuração a partir de variáveis de ambiente.
    ///
    /// ## Variáveis suportadas:
    ///
    /// - `OTEL_SERVICE_NAME`: Nome do serviço
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP
    /// - `OTEL_TRACES_SAMPLER_ARG`: Taxa de sampling (0.0-1.0)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

// ============================================================================
// INICIALIZAÇÃO
// ============================================================================

/// Inicializa o sistema de telemetria.
///
/// 1. Cria o TracerProvider com exporter OTLP (se configurado)
/// 2. Configura o sampler (taxa de coleta)
/// 3. Integra com tracing-subscriber para spans automáticos
///
/// ## Retorno:
///
/// - `Ok(Some(Tracer))`: OTLP configurado, tracer retornado
/// - `Ok(None)`: Apenas console logging (sem OTLP)
/// - `Err`: Erro ao configurar
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    // Primeiro tenta ler de RUST_LOG, senão usa o padrão.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;

        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(telemetry_layer);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "Telemetria OTEL inicializada"
        );

        Ok(Some(tracer))
    } else {
        // Sem OTLP, apenas console logging.
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        } else {
            subscriber.init();
        }

        tracing::info!("Telemetria inicializada (apenas console, sem OTLP)");
        Ok(None)
    }
}

// ============================================================================
// TRACER OTLP
// ============================================================================

/// Cria um tracer com OTLP exporter (gRPC via tonic).
fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        // Baseado no trace ID: traces relacionados são coletados juntos.
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    // Batch exporter: acumula spans e envia em lotes.
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());

    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

// ============================================================================
// ENCERRAMENTO
// ============================================================================

/// Encerra a telemetria, flushing spans pendentes.
///
/// **IMPORTANTE**: Deve ser chamado antes do encerramento da aplicação,
/// senão os spans acumulados no batch exporter são perdidos.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
    tracing::info!("Telemetria OTEL encerrada");
}

/// Helpers de instrumentação para operações sobre runs.
pub mod instrumentation {
    use std::time::Instant;
    use tracing::{field, Span};

    /// Contexto de instrumentação de uma operação da CLI sobre um run.
    ///
    /// Abre o span tracing da operação (exportado pela layer OTEL
    /// quando o exporter está configurado) e acumula os atributos
    /// finais preenchidos em [`RunSpanContext::finish`]. A CLI embrulha
    /// cada subcomando (inspect, replay, analyze, test) em um destes.
    #[derive(Debug)]
    pub struct RunSpanContext {
        /// Operação (inspect, replay, analyze, test).
        pub operation: String,
        /// Run alvo.
        pub run_id: String,
        /// Início da operação.
        pub start_time: Instant,
        /// Steps processados (preenchido após execução).
        pub steps: Option<usize>,
        /// Duração em millisegundos (preenchido após execução).
        pub duration_ms: Option<u64>,
        /// Span tracing subjacente da operação.
        span: Span,
    }

    impl RunSpanContext {
        /// Cria novo contexto de span para uma operação.
        pub fn new(operation: &str, run_id: &str) -> Self {
            let span = tracing::info_span!(
                "run_operation",
                trace.operation = %operation,
                run.id = %run_id,
                run.steps = field::Empty,
                trace.duration_ms = field::Empty,
            );
            Self {
                operation: operation.to_string(),
                run_id: run_id.to_string(),
                start_time: Instant::now(),
                steps: None,
                duration_ms: None,
                span,
            }
        }

        /// Executa `f` dentro do span da operação.
        pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
            self.span.in_scope(f)
        }

        /// Clone do span subjacente, para instrumentar futures com
        /// `tracing::Instrument`.
        pub fn tracing_span(&self) -> Span {
            self.span.clone()
        }

        /// Finaliza o span com o total de steps processados.
        pub fn finish(&mut self, steps: usize) {
            self.steps = Some(steps);
            let duration = self.start_time.elapsed().as_millis() as u64;
            self.duration_ms = Some(duration);
            self.span.record("run.steps", steps as u64);
            self.span.record("trace.duration_ms", duration);
        }

        /// Retorna os atributos como pares chave/valor para OTEL.
        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("trace.operation", self.operation.clone()),
                ("run.id", self.run_id.clone()),
            ];

            if let Some(steps) = self.steps {
                attrs.push(("run.steps", steps.to_string()));
            }

            if let Some(duration) = self.duration_ms {
                attrs.push(("trace.duration_ms", duration.to_string()));
            }

            attrs
        }
    }
}
