//! Offline correspondent merger.
//!
//! Groups correspondents by normalized key, keeps the one with the most
//! documents as primary, reassigns everything else to it and deletes the
//! emptied duplicates. Dry-run by default; `--apply` mutates.

use itertools::Itertools;

use crate::normalizer::Normalizer;

use super::api::{DeliveryResult, DocumentsApi, RemoteCorrespondent};

#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub key: String,
    pub target_name: String,
    pub primary: RemoteCorrespondent,
    pub duplicates: Vec<RemoteCorrespondent>,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub groups_merged: usize,
    pub documents_moved: usize,
    pub correspondents_deleted: usize,
}

pub struct Merger<'a, A> {
    api: &'a A,
    normalizer: &'a Normalizer,
}

impl<'a, A: DocumentsApi> Merger<'a, A> {
    pub fn new(api: &'a A, normalizer: &'a Normalizer) -> Self {
        Merger { api, normalizer }
    }

    /// Compute the merge plan without mutating anything.
    pub async fn plan(&self) -> DeliveryResult<Vec<MergeGroup>> {
        let correspondents = self.api.list_correspondents().await?;

        let mut groups: Vec<MergeGroup> = correspondents
            .into_iter()
            .filter_map(|c| {
                let key = self.normalizer.normalize(&c.name);
                (!key.is_empty()).then_some((key, c))
            })
            .into_group_map()
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, mut members)| {
                // Highest document count wins; stable on id for determinism.
                members.sort_by_key(|c| (std::cmp::Reverse(c.document_count), c.id));
                let primary = members.remove(0);
                let target_name = self.normalizer.best_display_name(&primary.name);
                MergeGroup {
                    key,
                    target_name,
                    primary,
                    duplicates: members,
                }
            })
            .collect();

        groups.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(groups)
    }

    /// Execute a previously computed plan.
    pub async fn apply(&self, groups: &[MergeGroup]) -> DeliveryResult<MergeReport> {
        let mut report = MergeReport::default();

        for group in groups {
            if group.primary.name != group.target_name {
                self.api
                    .rename_correspondent(group.primary.id, &group.target_name)
                    .await?;
            }

            for duplicate in &group.duplicates {
                let documents = self.api.documents_for_correspondent(duplicate.id).await?;
                for document_id in &documents {
                    self.api
                        .reassign_document(*document_id, group.primary.id)
                        .await?;
                    report.documents_moved += 1;
                }
                self.api.delete_correspondent(duplicate.id).await?;
                report.correspondents_deleted += 1;
                tracing::info!(
                    "merged '{}' (id {}, {} docs) into '{}' (id {})",
                    duplicate.name,
                    duplicate.id,
                    documents.len(),
                    group.target_name,
                    group.primary.id,
                );
            }
            report.groups_merged += 1;
        }

        Ok(report)
    }
}

pub fn format_plan(groups: &[MergeGroup]) -> String {
    if groups.is_empty() {
        return "no duplicate correspondents found".to_string();
    }
    let mut out = String::new();
    for group in groups {
        out.push_str(&format!(
            "{} -> '{}' keeps id {} ({} docs); merges: {}\n",
            group.key,
            group.target_name,
            group.primary.id,
            group.primary.document_count,
            group
                .duplicates
                .iter()
                .map(|d| format!("'{}' (id {}, {} docs)", d.name, d.id, d.document_count))
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::{MockApi, MockDocument};

    fn seed_aukro(api: &MockApi) {
        let mut state = api.state.lock().unwrap();
        state.correspondents = vec![
            RemoteCorrespondent {
                id: 1,
                name: "Aukro".to_string(),
                document_count: 0,
            },
            RemoteCorrespondent {
                id: 2,
                name: "aukro.cz".to_string(),
                document_count: 0,
            },
            RemoteCorrespondent {
                id: 3,
                name: "AUKRO s.r.o.".to_string(),
                document_count: 0,
            },
        ];
        let mut doc_id = 100;
        for (correspondent, count) in [(1u64, 50), (2, 30), (3, 14)] {
            for _ in 0..count {
                state.documents.push(MockDocument {
                    id: doc_id,
                    checksum: format!("{doc_id:032x}"),
                    correspondent: Some(correspondent),
                });
                doc_id += 1;
            }
        }
    }

    #[tokio::test]
    async fn aukro_variants_merge_into_primary() {
        let api = MockApi::default();
        seed_aukro(&api);
        let normalizer = Normalizer::default();
        let merger = Merger::new(&api, &normalizer);

        let plan = merger.plan().await.unwrap();
        assert_eq!(plan.len(), 1);
        let group = &plan[0];
        assert_eq!(group.key, "aukro");
        assert_eq!(group.primary.id, 1);
        assert_eq!(group.target_name, "Aukro");
        assert_eq!(group.duplicates.len(), 2);

        let report = merger.apply(&plan).await.unwrap();
        assert_eq!(report.documents_moved, 44);
        assert_eq!(report.correspondents_deleted, 2);

        let remaining = api.list_correspondents().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 1);
        assert_eq!(remaining[0].name, "Aukro");
        assert_eq!(remaining[0].document_count, 94);
    }

    #[tokio::test]
    async fn unique_correspondents_are_untouched() {
        let api = MockApi::default();
        {
            let mut state = api.state.lock().unwrap();
            state.correspondents = vec![
                RemoteCorrespondent {
                    id: 1,
                    name: "Adobe".to_string(),
                    document_count: 5,
                },
                RemoteCorrespondent {
                    id: 2,
                    name: "Loxone".to_string(),
                    document_count: 7,
                },
            ];
        }
        let normalizer = Normalizer::default();
        let merger = Merger::new(&api, &normalizer);

        let plan = merger.plan().await.unwrap();
        assert!(plan.is_empty());
        assert!(format_plan(&plan).contains("no duplicate"));
    }

    #[tokio::test]
    async fn plan_alone_does_not_mutate() {
        let api = MockApi::default();
        seed_aukro(&api);
        let normalizer = Normalizer::default();
        let merger = Merger::new(&api, &normalizer);

        let _plan = merger.plan().await.unwrap();
        assert_eq!(api.state.lock().unwrap().correspondents.len(), 3);
        assert_eq!(api.state.lock().unwrap().documents.len(), 94);
    }
}
