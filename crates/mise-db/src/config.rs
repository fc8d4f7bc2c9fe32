/// Where the meal-plan database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub database_url: String,
}

impl DbConfig {
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/mise";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Byte range of the database name within the URL.
    fn name_span(&self) -> Option<(usize, usize)> {
        let url = &self.database_url;
        let end = url.find('?').unwrap_or(url.len());
        let authority = url.find("://").map_or(0, |i| i + 3);
        let start = url.get(authority..end)?.rfind('/')? + authority + 1;
        (start < end).then_some((start, end))
    }

    /// The database name, if the URL has one.
    pub fn database_name(&self) -> Option<&str> {
        self.name_span().map(|(start, end)| &self.database_url[start..end])
    }

    /// The same server's `postgres` database, keeping any connection
    /// parameters. `mise db-init` creates the target database from there.
    pub fn maintenance_url(&self) -> String {
        match self.name_span() {
            Some((start, end)) => format!(
                "{}postgres{}",
                &self.database_url[..start],
                &self.database_url[end..]
            ),
            None => self.database_url.clone(),
        }
    }
}
