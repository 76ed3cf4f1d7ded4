//! # Módulo de Diff Estrutural
//!
//! Calcula e aplica deltas estruturais entre snapshots consecutivos de
//! memória do agente.
//!
//! ## Para todos entenderem:
//!
//! Em vez de guardar duas fotos inteiras e pedir para o leitor achar as
//! diferenças, o diff guarda só a lista de mudanças: "neste caminho, o
//! valor era X e virou Y". É o que permite responder "o que mudou no
//! step N?" sem comparar snapshots inteiros.
//!
//! ## Formato do delta:
//!
//! Uma lista ordenada de triplas `(path, old_value, new_value)`:
//!
//! - `path` endereça chaves de objeto e índices de array como segmentos
//!   de string, ex: `["memory", "0", "content"]`
//! - `old_value = null` marca uma adição
//! - `new_value = null` marca uma remoção
//!
//! A propriedade central: o diff do step N+1 aplicado ao snapshot N
//! reconstrói o snapshot N+1.

use serde_json::{Map, Value};

use crate::protocol::{DiffChange, MemoryState, StateDiff};

// ============================================================================
// CÁLCULO DO DELTA
// ============================================================================

/// Calcula o delta estrutural ordenado entre dois estados de memória.
///
/// Os caminhos endereçam chaves de objeto e índices de array como
/// segmentos de string, ex: `["memory", "0", "content"]`. `old_value`
/// nulo marca adição; `new_value` nulo marca remoção.
pub fn compute(step_id: u64, old: &MemoryState, new: &MemoryState) -> StateDiff {
    let old_v = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_v = serde_json::to_value(new).unwrap_or(Value::Null);

    let mut changes = Vec::new();
    walk(&old_v, &new_v, &mut Vec::new(), &mut changes);

    StateDiff { step_id, changes }
}

// ============================================================================
// APLICAÇÃO DO DELTA
// ============================================================================

/// Aplica um diff sobre um estado base, produzindo o estado sucessor.
///
/// `apply(compute(n, a, b), a) == b` vale para estados produzidos por
/// este crate; a propriedade é exercida pelos testes de round-trip
/// abaixo e pelo teste de snapshot/diff do recorder.
pub fn apply(base: &MemoryState, diff: &StateDiff) -> Result<MemoryState, serde_json::Error> {
    let mut root = serde_json::to_value(base)?;

    let (removals, writes): (Vec<_>, Vec<_>) = diff
        .changes
        .iter()
        .partition(|c| c.new_value.is_null() && !c.old_value.is_null());

    for change in writes {
        set_path(&mut root, &change.path, change.new_value.clone());
    }

    // Remoções em ordem reversa: dentro de um array elas vêm em índice
    // crescente, então o reverso remove sempre a cauda e os índices dos
    // irmãos não deslocam.
    for change in removals.iter().rev() {
        remove_path(&mut root, &change.path);
    }

    serde_json::from_value(root)
}

// ============================================================================
// CAMINHADA ESTRUTURAL
// ============================================================================

fn walk(old: &Value, new: &Value, path: &mut Vec<String>, changes: &mut Vec<DiffChange>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            // Chaves do lado antigo primeiro (ordem estável), depois as
            // que só existem no lado novo.
            for (k, ov) in o {
                path.push(k.clone());
                match n.get(k) {
                    Some(nv) => walk(ov, nv, path, changes),
                    None => changes.push(DiffChange {
                        path: path.clone(),
                        old_value: ov.clone(),
                        new_value: Value::Null,
                    }),
                }
                path.pop();
            }
            for (k, nv) in n {
                if o.contains_key(k) {
                    continue;
                }
                path.push(k.clone());
                changes.push(DiffChange {
                    path: path.clone(),
                    old_value: Value::Null,
                    new_value: nv.clone(),
                });
                path.pop();
            }
        }
        (Value::Array(o), Value::Array(n)) => {
            let len = o.len().max(n.len());
            for i in 0..len {
                path.push(i.to_string());
                match (o.get(i), n.get(i)) {
                    (Some(ov), Some(nv)) => walk(ov, nv, path, changes),
                    (Some(ov), None) => changes.push(DiffChange {
                        path: path.clone(),
                        old_value: ov.clone(),
                        new_value: Value::Null,
                    }),
                    (None, Some(nv)) => changes.push(DiffChange {
                        path: path.clone(),
                        old_value: Value::Null,
                        new_value: nv.clone(),
                    }),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        _ => changes.push(DiffChange {
            path: path.clone(),
            old_value: old.clone(),
            new_value: new.clone(),
        }),
    }
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        *root = value;
        return;
    };

    match root {
        Value::Object(map) => {
            let slot = map.entry(head.clone()).or_insert(Value::Null);
            if rest.is_empty() {
                *slot = value;
            } else {
                ensure_container(slot, rest);
                set_path(slot, rest, value);
            }
        }
        Value::Array(items) => {
            let Ok(idx) = head.parse::<usize>() else {
                return;
            };
            while items.len() <= idx {
                items.push(Value::Null);
            }
            if rest.is_empty() {
                items[idx] = value;
            } else {
                ensure_container(&mut items[idx], rest);
                set_path(&mut items[idx], rest, value);
            }
        }
        other => {
            // O caminho desce por um escalar: materializa o contêiner.
            *other = if head.parse::<usize>().is_ok() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
            set_path(other, path, value);
        }
    }
}

fn ensure_container(slot: &mut Value, rest: &[String]) {
    if slot.is_object() || slot.is_array() {
        return;
    }
    *slot = if rest[0].parse::<usize>().is_ok() {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    };
}

fn remove_path(root: &mut Value, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    match root {
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(head);
            } else if let Some(slot) = map.get_mut(head) {
                remove_path(slot, rest);
            }
        }
        Value::Array(items) => {
            let Ok(idx) = head.parse::<usize>() else {
                return;
            };
            if rest.is_empty() {
                // Remoções de cauda encolhem o array; remoções no meio
                // deixam null para não deslocar os índices dos irmãos.
                if idx == items.len().saturating_sub(1) {
                    items.pop();
                } else if idx < items.len() {
                    items[idx] = Value::Null;
                }
            } else if let Some(slot) = items.get_mut(idx) {
                remove_path(slot, rest);
            }
        }
        _ => {}
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryEntry;
    use serde_json::json;

    fn entry(role: &str, content: Value) -> MemoryEntry {
        MemoryEntry {
            role: role.into(),
            content,
            extra: Map::new(),
        }
    }

    fn state(entries: Vec<MemoryEntry>, tokens: u64) -> MemoryState {
        MemoryState {
            memory: entries,
            context_tokens: tokens,
            tools_state: Map::new(),
        }
    }

    #[test]
    fn test_identical_states_produce_empty_diff() {
        let a = state(vec![entry("user", json!("oi"))], 10);
        let diff = compute(2, &a, &a.clone());
        assert!(diff.changes.is_empty());
        assert_eq!(diff.step_id, 2);
    }

    #[test]
    fn test_scalar_change_has_old_and_new() {
        let a = state(vec![], 10);
        let b = state(vec![], 25);
        let diff = compute(2, &a, &b);
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].path, vec!["context_tokens"]);
        assert_eq!(diff.changes[0].old_value, json!(10));
        assert_eq!(diff.changes[0].new_value, json!(25));
    }

    #[test]
    fn test_appended_memory_entry_is_addition() {
        let a = state(vec![entry("user", json!("oi"))], 10);
        let b = state(
            vec![entry("user", json!("oi")), entry("assistant", json!("olá"))],
            12,
        );
        let diff = compute(2, &a, &b);
        let added = diff
            .changes
            .iter()
            .find(|c| c.path == vec!["memory", "1"])
            .expect("entrada adicionada presente no diff");
        assert_eq!(added.old_value, Value::Null);
        assert_eq!(added.new_value["role"], "assistant");
    }

    #[test]
    fn test_round_trip_apply() {
        // O diff aplicado ao estado N reconstrói o estado N+1.
        let mut tools = Map::new();
        tools.insert("search".into(), json!({"calls": 1}));

        let a = MemoryState {
            memory: vec![entry("user", json!("oi"))],
            context_tokens: 10,
            tools_state: tools,
        };

        let mut tools_b = Map::new();
        tools_b.insert("search".into(), json!({"calls": 2}));
        tools_b.insert("write".into(), json!({"calls": 1}));

        let b = MemoryState {
            memory: vec![
                entry("user", json!("oi")),
                entry("assistant", json!({"answer": 42})),
            ],
            context_tokens: 31,
            tools_state: tools_b,
        };

        let diff = compute(2, &a, &b);
        let rebuilt = apply(&a, &diff).unwrap();
        assert_eq!(rebuilt, b);
    }

    #[test]
    fn test_round_trip_with_multi_tail_removal() {
        // Encolhimento de 3 entradas para 1: as duas remoções de cauda
        // não podem deixar buracos nulos.
        let a = state(
            vec![
                entry("user", json!("oi")),
                entry("assistant", json!("x")),
                entry("observation", json!("y")),
            ],
            5,
        );
        let b = state(vec![entry("user", json!("oi"))], 5);
        let diff = compute(4, &a, &b);
        let rebuilt = apply(&a, &diff).unwrap();
        assert_eq!(rebuilt, b);
    }

    #[test]
    fn test_round_trip_with_removal() {
        let b = state(vec![entry("user", json!("oi"))], 5);
        let a = state(
            vec![entry("user", json!("oi")), entry("assistant", json!("x"))],
            5,
        );
        let diff = compute(3, &a, &b);
        let rebuilt = apply(&a, &diff).unwrap();
        assert_eq!(rebuilt, b);
    }
}
