/// Builds a `--key value` argument list, skipping keys whose value is absent.
///
/// Keys are passed through as given apart from underscores, which become
/// dashes (`output_dir` -> `--output-dir`).
pub fn flag_args<I, K, V>(pairs: I) -> Vec<String>
where
    I: IntoIterator<Item = (K, Option<V>)>,
    K: AsRef<str>,
    V: ToString,
{
    pairs
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value.to_string())))
        .flat_map(|(key, value)| {
            let flag = format!("--{}", key.as_ref().trim_start_matches('-').replace('_', "-"));
            [flag, value]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn skips_absent_values_and_keeps_order() {
        let args = flag_args([
            ("input_protein", Some("protein.pdb")),
            ("restraints_file", None),
            ("output_dir", Some("out")),
        ]);
        assert_eq!(
            args,
            vec!["--input-protein", "protein.pdb", "--output-dir", "out"]
        );
    }

    #[test]
    fn formats_non_string_values() {
        let args = flag_args([("peptide_length", Some(12)), ("seed", None)]);
        assert_eq!(args, vec!["--peptide-length", "12"]);

        let path = Path::new("a/b.pdb").display();
        let args = flag_args([("--input", Some(path))]);
        assert_eq!(args, vec!["--input", "a/b.pdb"]);
    }
}
