//! # Módulo de Store de Artefatos
//!
//! Persistência autoritativa de um run: tudo que os outros componentes
//! sabem sobre uma execução passa por aqui, na escrita e na leitura.
//!
//! ## Para todos entenderem:
//!
//! Pense no store como o cartório do sistema. O recorder traz os fatos
//! (steps, snapshots, I/O) e o cartório registra em livros append-only.
//! Depois do seal, o livro é lacrado: qualquer um pode ler, ninguém
//! pode escrever.
//!
//! ## Disciplina de escrita:
//!
//! - `steps.jsonl` fica com o handle aberto durante todo o run; cada
//!   append é uma linha única terminada em newline com um único flush.
//! - Snapshots e diffs abrem, escrevem e fecham por step.
//! - O seal reescreve `meta.json` com os campos terminais, grava o
//!   digest SHA-256 do log e força sync - a partir daí toda escrita
//!   falha com `Sealed`.
//!
//! ## Disciplina de leitura:
//!
//! Leitores toleram runs parciais (processo morreu antes do seal):
//! - A última linha do log pode estar truncada; ela é descartada e o
//!   run carrega com o indicador `partial`.
//! - Snapshots, diffs e I/O são sidecars preguiçosos: resolvidos sob
//!   demanda e a ausência deles não é erro.

use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{TraceError, TraceResult};
use crate::protocol::{
    diff_rel_path, snapshot_rel_path, tool_io_rel_path, IoStream, RunMeta, RunStatus, Snapshot,
    StateDiff, StepRecord, DIFFS_DIR, META_FILE, SNAPSHOTS_DIR, STEPS_FILE, TOOLS_DIR,
};

// ============================================================================
// STORE DE ESCRITA
// ============================================================================

/// Handle de escrita de um run não selado.
///
/// Existe no máximo um por run: o recorder é o único escritor. Todas as
/// operações de escrita falham com [`TraceError::Sealed`] após o seal.
#[derive(Debug)]
pub struct ArtifactStore {
    run_dir: PathBuf,
    meta: RunMeta,
    steps_file: File,
    sealed: bool,
}

impl ArtifactStore {
    /// Estabelece o diretório do run e grava os metadados iniciais.
    ///
    /// Cria `meta.json` (com `status=running`), um `steps.jsonl` vazio
    /// e os subdiretórios de sidecars. Falha se o diretório já contém
    /// um run.
    pub fn create(run_dir: &Path, meta: RunMeta) -> TraceResult<Self> {
        if run_dir.join(META_FILE).exists() {
            return Err(TraceError::InvalidArtifact {
                path: run_dir.display().to_string(),
                detail: "diretório já contém um run".into(),
            });
        }

        fs::create_dir_all(run_dir)?;
        fs::create_dir_all(run_dir.join(SNAPSHOTS_DIR))?;
        fs::create_dir_all(run_dir.join(DIFFS_DIR))?;
        fs::create_dir_all(run_dir.join(TOOLS_DIR))?;

        write_meta(run_dir, &meta)?;

        // Handle mantido aberto pela duração do run; cada append faz um
        // único write + flush.
        let steps_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(STEPS_FILE))?;

        debug!(run_id = %meta.run_id, run_dir = %run_dir.display(), "Run directory created");

        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            meta,
            steps_file,
            sealed: false,
        })
    }

    /// Diretório do run.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Identificador do run.
    pub fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    /// Indica se o run já foi selado.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn ensure_unsealed(&self) -> TraceResult<()> {
        if self.sealed {
            return Err(TraceError::Sealed {
                run_id: self.meta.run_id.clone(),
            });
        }
        Ok(())
    }

    /// Anexa um registro ao log de steps.
    ///
    /// Um registro = uma linha terminada em newline, escrita com um
    /// único write e um flush - durável até a page cache do SO.
    pub fn append_step(&mut self, record: &StepRecord) -> TraceResult<()> {
        self.ensure_unsealed()?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.steps_file.write_all(line.as_bytes())?;
        self.steps_file.flush()?;
        Ok(())
    }

    /// Grava o snapshot de um step (abre, escreve, fecha).
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> TraceResult<()> {
        self.ensure_unsealed()?;

        let path = self.run_dir.join(snapshot_rel_path(snapshot.step_id));
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Grava o diff de um step.
    pub fn write_diff(&self, diff: &StateDiff) -> TraceResult<()> {
        self.ensure_unsealed()?;

        let path = self.run_dir.join(diff_rel_path(diff.step_id));
        let json = serde_json::to_string_pretty(diff)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Anexa bytes capturados ao stream de I/O de um step.
    ///
    /// O stream pode receber vários appends enquanto o step está aberto
    /// (captura concorrente à execução da ferramenta).
    pub fn capture_tool_io(
        &self,
        step_id: u64,
        stream: IoStream,
        bytes: &[u8],
    ) -> TraceResult<()> {
        self.ensure_unsealed()?;

        let path = self.run_dir.join(tool_io_rel_path(step_id, stream));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Sela o run com os campos terminais.
    ///
    /// Reescreve `meta.json` com status, motivo, flag de truncamento e
    /// o digest SHA-256 de `steps.jsonl`; força sync do log para
    /// sobreviver a crash. Após o retorno, o store rejeita escritas.
    pub fn seal(
        &mut self,
        status: RunStatus,
        reason: Option<String>,
        truncated: bool,
    ) -> TraceResult<()> {
        self.ensure_unsealed()?;

        // Flush explícito exigido para segurança de crash no seal.
        self.steps_file.sync_all()?;

        self.meta.status = status;
        self.meta.termination_reason = reason;
        self.meta.truncated = truncated;
        self.meta.steps_digest = Some(digest_steps_file(&self.run_dir)?);

        write_meta(&self.run_dir, &self.meta)?;
        self.sealed = true;

        debug!(run_id = %self.meta.run_id, status = ?status, truncated, "Run sealed");
        Ok(())
    }
}

fn write_meta(run_dir: &Path, meta: &RunMeta) -> TraceResult<()> {
    let json = serde_json::to_string_pretty(meta)?;
    let path = run_dir.join(META_FILE);
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Digest SHA-256 (hex) do conteúdo corrente de `steps.jsonl`.
pub fn digest_steps_file(run_dir: &Path) -> TraceResult<String> {
    let mut file = File::open(run_dir.join(STEPS_FILE))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// LEITURA: LOADED RUN
// ============================================================================

/// Um run carregado do disco.
///
/// Metadados e log vêm ansiosos; snapshots, diffs e I/O são resolvidos
/// sob demanda pelos métodos `load_*`.
#[derive(Debug, Clone)]
pub struct LoadedRun {
    /// Diretório de origem.
    pub dir: PathBuf,

    /// Metadados parseados de `meta.json`.
    pub meta: RunMeta,

    /// Registros do log, na ordem do arquivo.
    pub steps: Vec<StepRecord>,

    /// Run incompleto: sem status terminal ou com cauda descartada.
    pub partial: bool,
}

/// Carrega um run do disco, tolerando escrita parcial.
///
/// - `meta.json` ausente ou malformado → [`TraceError::InvalidArtifact`]
/// - Última linha do log malformada → descartada, run marcado `partial`
/// - Linha malformada no MEIO do log → corrupção, `InvalidArtifact`
pub fn load(run_dir: &Path) -> TraceResult<LoadedRun> {
    let meta_path = run_dir.join(META_FILE);
    let meta_raw = fs::read_to_string(&meta_path).map_err(|e| TraceError::InvalidArtifact {
        path: meta_path.display().to_string(),
        detail: format!("metadados ilegíveis: {}", e),
    })?;
    let meta: RunMeta =
        serde_json::from_str(&meta_raw).map_err(|e| TraceError::InvalidArtifact {
            path: meta_path.display().to_string(),
            detail: format!("metadados malformados: {}", e),
        })?;

    let steps_path = run_dir.join(STEPS_FILE);
    let file = File::open(&steps_path).map_err(|e| TraceError::InvalidArtifact {
        path: steps_path.display().to_string(),
        detail: format!("log de steps ilegível: {}", e),
    })?;

    let reader = BufReader::new(file);
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .map_err(TraceError::Io)?;

    let mut steps = Vec::with_capacity(lines.len());
    let mut dropped_tail = false;
    let last = lines.len().saturating_sub(1);

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StepRecord>(line) {
            Ok(record) => steps.push(record),
            Err(e) if i == last => {
                // Crash no meio de um append: a cauda truncada é
                // descartada e o run vira parcial.
                warn!(
                    run_id = %meta.run_id,
                    line = i + 1,
                    error = %e,
                    "Última linha do log malformada; descartando"
                );
                dropped_tail = true;
            }
            Err(e) => {
                return Err(TraceError::InvalidArtifact {
                    path: steps_path.display().to_string(),
                    detail: format!("linha {} malformada no meio do log: {}", i + 1, e),
                });
            }
        }
    }

    let partial = dropped_tail || !meta.status.is_terminal();

    Ok(LoadedRun {
        dir: run_dir.to_path_buf(),
        meta,
        steps,
        partial,
    })
}

impl LoadedRun {
    /// Registro de um step pelo identificador.
    pub fn step(&self, step_id: u64) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Carrega o snapshot de um step sob demanda.
    ///
    /// `Ok(None)` quando o sidecar não existe (run parcial).
    pub fn load_snapshot(&self, step_id: u64) -> TraceResult<Option<Snapshot>> {
        let path = self.dir.join(snapshot_rel_path(step_id));
        read_optional_json(&path)
    }

    /// Carrega o diff de um step sob demanda.
    pub fn load_diff(&self, step_id: u64) -> TraceResult<Option<StateDiff>> {
        let path = self.dir.join(diff_rel_path(step_id));
        read_optional_json(&path)
    }

    /// Carrega os bytes de um stream de I/O capturado.
    pub fn load_tool_io(&self, step_id: u64, stream: IoStream) -> TraceResult<Option<Vec<u8>>> {
        let path = self.dir.join(tool_io_rel_path(step_id, stream));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TraceError::Io(e)),
        }
    }

    /// Snapshot do último step do log, se existir.
    pub fn final_snapshot(&self) -> TraceResult<Option<Snapshot>> {
        match self.steps.last() {
            Some(step) => self.load_snapshot(step.step_id),
            None => Ok(None),
        }
    }

    /// Recalcula o digest do log para conferência contra o do seal.
    pub fn recompute_digest(&self) -> TraceResult<String> {
        digest_steps_file(&self.dir)
    }
}

fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> TraceResult<Option<T>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let value = serde_json::from_str(&raw).map_err(|e| TraceError::InvalidArtifact {
                path: path.display().to_string(),
                detail: format!("sidecar malformado: {}", e),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TraceError::Io(e)),
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    fn meta(run_id: &str) -> RunMeta {
        RunMeta {
            run_id: run_id.into(),
            agent_version: "1".into(),
            llm: "m".into(),
            temperature: 0.0,
            tools: vec!["s".into()],
            seed: 0,
            created_at: "2024-01-15T12:00:00Z".into(),
            status: RunStatus::Running,
            termination_reason: None,
            truncated: false,
            tags: Vec::new(),
            steps_digest: None,
            extra: Map::new(),
        }
    }

    fn record(step_id: u64) -> StepRecord {
        let mut input = Map::new();
        input.insert("p".into(), json!("hi"));
        StepRecord {
            step_id,
            timestamp: 1_700_000_000_000,
            phase: crate::protocol::Phase::Reason,
            input,
            output: Map::new(),
            state_ref: snapshot_rel_path(step_id),
            diff_ref: None,
            status: crate::protocol::StepStatus::Ok,
            duration_ms: Some(5),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_create_layout() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let store = ArtifactStore::create(&dir, meta("r1")).unwrap();

        assert!(dir.join(META_FILE).exists());
        assert!(dir.join(STEPS_FILE).exists());
        assert!(dir.join(SNAPSHOTS_DIR).is_dir());
        assert!(dir.join(DIFFS_DIR).is_dir());
        assert!(dir.join(TOOLS_DIR).is_dir());
        assert!(!store.is_sealed());
    }

    #[test]
    fn test_create_refuses_existing_run() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        ArtifactStore::create(&dir, meta("r1")).unwrap();
        let err = ArtifactStore::create(&dir, meta("r2")).unwrap_err();
        assert!(matches!(err, TraceError::InvalidArtifact { .. }));
    }

    #[test]
    fn test_append_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();

        store.append_step(&record(1)).unwrap();
        store.append_step(&record(2)).unwrap();
        store
            .seal(RunStatus::Success, Some("success".into()), false)
            .unwrap();

        let run = load(&dir).unwrap();
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].step_id, 1);
        assert_eq!(run.meta.status, RunStatus::Success);
        assert!(!run.partial);
    }

    #[test]
    fn test_sealed_store_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.seal(RunStatus::Aborted, None, false).unwrap();

        let err = store.append_step(&record(1)).unwrap_err();
        assert!(matches!(err, TraceError::Sealed { .. }));
        let err = store
            .capture_tool_io(1, IoStream::Stdout, b"x")
            .unwrap_err();
        assert!(matches!(err, TraceError::Sealed { .. }));
    }

    #[test]
    fn test_load_tolerates_truncated_tail() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        drop(store);

        // Simula crash no meio de um append: cauda sem newline e sem
        // JSON completo.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.join(STEPS_FILE))
            .unwrap();
        file.write_all(b"{\"step_id\": 2, \"timest").unwrap();
        drop(file);

        let run = load(&dir).unwrap();
        assert_eq!(run.steps.len(), 1);
        assert!(run.partial);
    }

    #[test]
    fn test_load_rejects_mid_log_corruption() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        drop(store);

        let existing = fs::read_to_string(dir.join(STEPS_FILE)).unwrap();
        let corrupted = format!("not json\n{}", existing);
        fs::write(dir.join(STEPS_FILE), corrupted).unwrap();

        let err = load(&dir).unwrap_err();
        assert!(matches!(err, TraceError::InvalidArtifact { .. }));
    }

    #[test]
    fn test_unsealed_run_loads_as_partial() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        // Sem seal: simula processo que morreu.
        drop(store);

        let run = load(&dir).unwrap();
        assert!(run.partial);
        assert_eq!(run.meta.status, RunStatus::Running);
    }

    #[test]
    fn test_missing_meta_is_invalid_artifact() {
        let tmp = TempDir::new().unwrap();
        let err = load(&tmp.path().join("nada")).unwrap_err();
        assert!(matches!(err, TraceError::InvalidArtifact { .. }));
    }

    #[test]
    fn test_lazy_sidecars_tolerate_absence() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        drop(store);

        let run = load(&dir).unwrap();
        assert!(run.load_snapshot(1).unwrap().is_none());
        assert!(run.load_diff(1).unwrap().is_none());
        assert!(run.load_tool_io(1, IoStream::Stderr).unwrap().is_none());
    }

    #[test]
    fn test_seal_records_matching_digest() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();

        let run = load(&dir).unwrap();
        let recorded = run.meta.steps_digest.clone().unwrap();
        assert_eq!(recorded, run.recompute_digest().unwrap());
    }

    #[test]
    fn test_tool_io_appends() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run1");
        let store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.capture_tool_io(3, IoStream::Stdout, b"abc").unwrap();
        store.capture_tool_io(3, IoStream::Stdout, b"def").unwrap();
        drop(store);

        let run = load(&dir);
        // steps.jsonl vazio: run carrega sem steps.
        let run = run.unwrap();
        assert_eq!(
            run.load_tool_io(3, IoStream::Stdout).unwrap().unwrap(),
            b"abcdef"
        );
    }
}
