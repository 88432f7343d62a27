use std::collections::HashMap;

use crate::config::LabelRule;

/// Maps raw container labels into the output schema. Only labels named in
/// the config's rename table are projected; everything else is dropped.
#[derive(Debug)]
pub(crate) struct LabelMap {
    /// source label key -> output key
    renames: HashMap<String, String>,
}

impl LabelMap {
    pub(crate) fn new(rules: HashMap<String, LabelRule>) -> Self {
        let renames = rules
            .into_iter()
            .map(|(source, rule)| {
                let target = rule.rename.unwrap_or_else(|| source.clone());
                (source, target)
            })
            .collect();
        Self { renames }
    }

    pub(crate) fn project(&self, raw: &HashMap<String, String>) -> HashMap<String, String> {
        self.renames
            .iter()
            .filter_map(|(source, target)| {
                raw.get(source).map(|value| (target.clone(), value.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[(&str, Option<&str>)]) -> HashMap<String, LabelRule> {
        entries
            .iter()
            .map(|(key, rename)| {
                (
                    key.to_string(),
                    LabelRule {
                        rename: rename.map(str::to_owned),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn projects_only_mapped_labels_under_their_renamed_keys() {
        let map = LabelMap::new(rules(&[("io.kubernetes.pod.namespace", Some("ns"))]));
        let raw = HashMap::from([
            ("io.kubernetes.pod.namespace".to_owned(), "prod".to_owned()),
            ("other".to_owned(), "x".to_owned()),
        ]);

        let projected = map.project(&raw);
        assert_eq!(projected, HashMap::from([("ns".to_owned(), "prod".to_owned())]));
    }

    #[test]
    fn rule_without_rename_keeps_the_source_key() {
        let map = LabelMap::new(rules(&[("team", None)]));
        let raw = HashMap::from([("team".to_owned(), "infra".to_owned())]);
        assert_eq!(
            map.project(&raw),
            HashMap::from([("team".to_owned(), "infra".to_owned())])
        );
    }

    #[test]
    fn absent_source_labels_project_nothing() {
        let map = LabelMap::new(rules(&[("io.kubernetes.pod.namespace", Some("ns"))]));
        assert!(map.project(&HashMap::new()).is_empty());
    }
}
