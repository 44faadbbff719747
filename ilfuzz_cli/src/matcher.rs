/// Decides which types and methods get instrumented, by case-insensitive
/// name prefix.
///
/// Method names are matched without their leading return type, so the
/// prefix `Acme.Parser` selects both the type and all of its methods.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Matcher {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        let lower = |prefixes: Vec<String>| {
            prefixes
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            include: lower(include),
            exclude: lower(exclude),
        }
    }

    pub fn has_includes(&self) -> bool {
        !self.include.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        let trimmed = name.split_once(' ').map_or(name, |(_, rest)| rest);
        let lower = trimmed.to_lowercase();

        if self.exclude.iter().any(|p| lower.starts_with(p.as_str())) {
            log::info!("Excluded: {trimmed}");
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| lower.starts_with(p.as_str()))
    }
}

/// Parses a prefix list file: one prefix per line, anything after ` :` is a
/// comment, blank lines are skipped.
pub fn parse_prefix_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split_once(" :").map_or(line, |(prefix, _)| prefix).trim())
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn everything_matches_without_prefixes() {
        let matcher = Matcher::default();
        assert!(matcher.matches("Acme.Parser"));
        assert!(matcher.matches("System.Void Acme.Parser::Run()"));
    }

    #[test]
    fn prefixes_ignore_case_and_return_types() {
        let matcher = Matcher::new(strings(&["acme.parser"]), strings(&["Acme.Parser::Slow"]));
        assert!(matcher.matches("Acme.Parser"));
        assert!(matcher.matches("System.Int32 Acme.Parser::Parse(System.String)"));
        assert!(!matcher.matches("System.Void Acme.Parser::SlowPath()"));
        assert!(!matcher.matches("Acme.Lexer"));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let matcher = Matcher::new(strings(&["Acme"]), strings(&["Acme.Internal"]));
        assert!(!matcher.matches("Acme.Internal.Cache"));
        assert!(matcher.matches("Acme.Public"));
    }

    #[test]
    fn prefix_files_allow_comments() {
        let text = "System.Number : parsing\n\n  System.Text \nSystem.Globalization.Calendar\n";
        assert_eq!(
            parse_prefix_list(text),
            strings(&["System.Number", "System.Text", "System.Globalization.Calendar"])
        );
    }
}
