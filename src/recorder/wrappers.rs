//! # Wrappers de Instrumentação - Ferramentas e Modelo
//!
//! Embrulham a execução real de uma ferramenta ou chamada de modelo e
//! gravam o step correspondente no trace.
//!
//! ## Para todos entenderem:
//!
//! O agente não fala com o recorder diretamente. Ele chama a ferramenta
//! através do wrapper, e o wrapper cuida de:
//!
//! 1. Abrir o escopo do step (fase `tool` ou `reason`)
//! 2. Executar a ação real, com I/O capturado para o step aberto
//! 3. Fechar o escopo com o resultado (ou a falha)
//! 4. Aplicar a política de retry, gravando cada tentativa falha como
//!    um step de fase `retry`
//!
//! ## Semântica de retry no trace:
//!
//! Com `max_retries = 2` e duas falhas seguidas de um sucesso:
//!
//! ```text
//! retry (attempt=1), retry (attempt=2), tool (status=ok)
//! ```
//!
//! Com três falhas (política esgotada):
//!
//! ```text
//! retry (attempt=1), retry (attempt=2), tool (status=error)
//! ```
//!
//! O I/O capturado em cada tentativa pertence SOMENTE ao step daquela
//! tentativa - nada é fundido no step de sucesso.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Recorder, ToolIoHandle};
use crate::protocol::{IoStream, Phase, StepStatus};
use crate::retry::RetryPolicy;

// ============================================================================
// SEAM DE FERRAMENTA
// ============================================================================

/// Par de handles de captura entregue à ferramenta durante a execução.
#[derive(Debug, Clone)]
pub struct ToolIo {
    /// Captura do stdout da ferramenta.
    pub stdout: ToolIoHandle,

    /// Captura do stderr da ferramenta.
    pub stderr: ToolIoHandle,
}

/// Contrato de uma ferramenta gravável.
///
/// O trait requer Send + Sync para execução dentro de tasks tokio.
#[async_trait]
pub trait RecordedTool: Send + Sync {
    /// Nome estável da ferramenta, gravado em `input.tool`.
    fn name(&self) -> &str;

    /// Executa a ferramenta. Tudo que for escrito nos handles de `io`
    /// é atribuído ao step da tentativa corrente.
    async fn invoke(&self, args: &Value, io: &ToolIo) -> anyhow::Result<Value>;
}

// ============================================================================
// WRAPPER DE FERRAMENTA
// ============================================================================

/// Wrapper que grava cada invocação de uma ferramenta.
pub struct ToolWrapper {
    recorder: Recorder,
    tool: Arc<dyn RecordedTool>,
    policy: RetryPolicy,
}

impl ToolWrapper {
    /// Embrulha uma ferramenta sem política de retry (fail-fast).
    pub fn new(recorder: &Recorder, tool: Arc<dyn RecordedTool>) -> Self {
        Self {
            recorder: recorder.clone(),
            tool,
            policy: RetryPolicy::default(),
        }
    }

    /// Define a política de retry do wrapper.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Nome da ferramenta embrulhada.
    pub fn name(&self) -> &str {
        self.tool.name()
    }

    /// Invoca a ferramenta, gravando steps conforme a política.
    ///
    /// Retorna o valor da ferramenta em sucesso (inclusive após
    /// retries); propaga o último erro quando a política esgota.
    /// Cancelamento no meio de uma tentativa fecha o step daquela
    /// tentativa como `error` antes de propagar.
    pub async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let attempts = self.policy.attempts();
        let mut attempt: u32 = 1;

        loop {
            let mut input = Map::new();
            input.insert("tool".into(), Value::String(self.tool.name().into()));
            input.insert("args".into(), args.clone());
            if attempt > 1 {
                input.insert("attempt".into(), Value::from(attempt));
            }

            let mut scope = self.recorder.step(Phase::Tool, input)?;
            let io = ToolIo {
                stdout: self.recorder.io_handle(IoStream::Stdout),
                stderr: self.recorder.io_handle(IoStream::Stderr),
            };

            match self.tool.invoke(&args, &io).await {
                Ok(value) => {
                    scope.set_output("result", value.clone());
                    scope.finish()?;
                    if attempt > 1 {
                        info!(tool = self.tool.name(), attempt, "Retry bem sucedido");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt < attempts {
                        // Tentativa falha vira step de fase retry; a
                        // próxima tentativa abre um step novo.
                        scope.set_phase(Phase::Retry);
                        scope.set_status(StepStatus::Retry);
                        scope.set_output("attempt", Value::from(attempt));
                        scope.set_output("cause", Value::String(e.to_string()));
                        scope.finish()?;
                        warn!(
                            tool = self.tool.name(),
                            attempt,
                            max_attempts = attempts,
                            error = %e,
                            "Tentativa falhou, aguardando retry"
                        );
                        self.policy.wait(attempt).await;
                        attempt += 1;
                    } else {
                        scope.set_output("attempt", Value::from(attempt));
                        scope.fail(&e.to_string())?;
                        warn!(
                            tool = self.tool.name(),
                            attempt,
                            error = %e,
                            "Todas as tentativas esgotadas"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

// ============================================================================
// WRAPPER DE MODELO
// ============================================================================

/// Wrapper que grava cada chamada de modelo como step de fase `reason`.
///
/// O prompt vai no payload de entrada e a resposta (incluindo qualquer
/// hint de ação) no payload de saída.
pub struct ModelWrapper {
    recorder: Recorder,
}

impl ModelWrapper {
    /// Cria o wrapper sobre um recorder.
    pub fn new(recorder: &Recorder) -> Self {
        Self {
            recorder: recorder.clone(),
        }
    }

    /// Executa a chamada de modelo `f` gravando o step `reason`.
    pub async fn call<F, Fut>(
        &self,
        prompt: Value,
        f: F,
    ) -> anyhow::Result<Map<String, Value>>
    where
        F: FnOnce(Value) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Map<String, Value>>> + Send,
    {
        let mut input = Map::new();
        input.insert("prompt".into(), prompt.clone());

        let mut scope = self.recorder.step(Phase::Reason, input)?;

        match f(prompt).await {
            Ok(response) => {
                scope.set_output_map(response.clone());
                scope.finish()?;
                Ok(response)
            }
            Err(e) => {
                scope.fail(&e.to_string())?;
                Err(e)
            }
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testutil;
    use crate::recorder::{RecorderConfig, RunInfo};
    use crate::store;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Ferramenta que falha as primeiras `failures` invocações,
    /// escrevendo a tentativa no stderr capturado.
    struct FlakyTool {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyTool {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecordedTool for FlakyTool {
        fn name(&self) -> &str {
            "s"
        }

        async fn invoke(&self, _args: &Value, io: &ToolIo) -> anyhow::Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                io.stderr
                    .write(format!("tentativa {} falhou\n", call).as_bytes());
                anyhow::bail!("falha transitória na chamada {}", call);
            }
            io.stdout.write(b"ok\n");
            Ok(json!("R"))
        }
    }

    fn recorder(tmp: &TempDir) -> crate::recorder::Recorder {
        crate::recorder::Recorder::init(
            RecorderConfig {
                base_dir: tmp.path().to_path_buf(),
                strict: true,
                ..RecorderConfig::default()
            },
            RunInfo::new("1", "m", 0, vec!["s".into()]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_tool_success_records_single_tool_step() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);

        let wrapper = ToolWrapper::new(&rec, FlakyTool::failing(0));
        let result = wrapper.call(json!({"q": 1})).await.unwrap();
        assert_eq!(result, json!("R"));

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].phase, Phase::Tool);
        assert_eq!(run.steps[0].status, StepStatus::Ok);
        assert_eq!(run.steps[0].tool_name(), Some("s"));
        assert_eq!(run.steps[0].output["result"], "R");
    }

    #[tokio::test]
    async fn test_retry_twice_then_success() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);

        let wrapper =
            ToolWrapper::new(&rec, FlakyTool::failing(2)).with_policy(RetryPolicy::retries(2));
        let result = wrapper.call(json!({"q": 1})).await.unwrap();
        assert_eq!(result, json!("R"));

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        let phases: Vec<Phase> = run.steps.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![Phase::Retry, Phase::Retry, Phase::Tool]);
        assert_eq!(run.steps[2].status, StepStatus::Ok);
        assert_eq!(run.steps[0].output["attempt"], 1);
        assert_eq!(run.steps[1].output["attempt"], 2);
        assert!(run.steps[0].output["cause"]
            .as_str()
            .unwrap()
            .contains("transitória"));

        // I/O por tentativa: o stderr de cada retry fica no step da
        // própria tentativa, não no step de sucesso.
        let err1 = run.load_tool_io(1, IoStream::Stderr).unwrap().unwrap();
        let err2 = run.load_tool_io(2, IoStream::Stderr).unwrap().unwrap();
        assert!(String::from_utf8(err1).unwrap().contains("tentativa 1"));
        assert!(String::from_utf8(err2).unwrap().contains("tentativa 2"));
        assert!(run.load_tool_io(3, IoStream::Stderr).unwrap().is_none());
        let out3 = run.load_tool_io(3, IoStream::Stdout).unwrap().unwrap();
        assert_eq!(out3, b"ok\n");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_records_error_tool_step() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);

        let wrapper =
            ToolWrapper::new(&rec, FlakyTool::failing(3)).with_policy(RetryPolicy::retries(2));
        let err = wrapper.call(json!({"q": 1})).await.unwrap_err();
        assert!(err.to_string().contains("chamada 3"));

        let dir = rec.run_dir().to_path_buf();
        rec.stop("failure").unwrap();

        let run = store::load(&dir).unwrap();
        let phases: Vec<Phase> = run.steps.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![Phase::Retry, Phase::Retry, Phase::Tool]);
        assert_eq!(run.steps[2].status, StepStatus::Error);
        assert!(run.steps[2].output["error"]
            .as_str()
            .unwrap()
            .contains("chamada 3"));
    }

    #[tokio::test]
    async fn test_model_wrapper_records_reason_step() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);

        let model = ModelWrapper::new(&rec);
        let response = model
            .call(json!("qual o tempo?"), |_prompt| async {
                let mut out = Map::new();
                out.insert("response".into(), json!("ensolarado"));
                out.insert("action".into(), json!({"tool": "s"}));
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(response["response"], "ensolarado");

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].phase, Phase::Reason);
        assert_eq!(run.steps[0].input["prompt"], "qual o tempo?");
        assert_eq!(run.steps[0].output["action"]["tool"], "s");
    }

    #[tokio::test]
    async fn test_model_failure_records_error_step() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);

        let model = ModelWrapper::new(&rec);
        let err = model
            .call(json!("p"), |_prompt| async {
                anyhow::bail!("modelo indisponível")
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("indisponível"));

        let dir = rec.run_dir().to_path_buf();
        rec.stop("failure").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps[0].status, StepStatus::Error);
        assert!(run.steps[0].output["error"]
            .as_str()
            .unwrap()
            .contains("indisponível"));
    }
}
