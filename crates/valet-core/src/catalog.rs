//! Static top-tools catalog: the canonical tool names per app, with human
//! descriptions, used by the router to pick candidate apps and tools.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct TopToolsCatalog {
    apps: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for TopToolsCatalog {
    fn default() -> Self {
        let mut apps = BTreeMap::new();

        apps.insert(
            "GMAIL".to_string(),
            entries(&[
                ("GMAIL_SEND_EMAIL", "Send an email to one or more recipients"),
                ("GMAIL_FETCH_EMAILS", "Fetch recent emails, optionally filtered by a query"),
                ("GMAIL_CREATE_EMAIL_DRAFT", "Create a draft email without sending it"),
                ("GMAIL_REPLY_TO_THREAD", "Reply within an existing email thread"),
            ]),
        );
        apps.insert(
            "GOOGLECALENDAR".to_string(),
            entries(&[
                ("GOOGLECALENDAR_CREATE_EVENT", "Create a calendar event with attendees and times"),
                ("GOOGLECALENDAR_LIST_EVENTS", "List upcoming events in a date range"),
                ("GOOGLECALENDAR_UPDATE_EVENT", "Update an existing event's fields"),
                ("GOOGLECALENDAR_DELETE_EVENT", "Delete an event by id"),
            ]),
        );
        apps.insert(
            "GOOGLEDRIVE".to_string(),
            entries(&[
                ("GOOGLEDRIVE_UPLOAD_FILE", "Upload a file to Drive"),
                ("GOOGLEDRIVE_FIND_FILE", "Search Drive for files by name or content"),
                ("GOOGLEDRIVE_CREATE_FOLDER", "Create a folder"),
                ("GOOGLEDRIVE_DOWNLOAD_FILE", "Download a file's content by id"),
            ]),
        );
        apps.insert(
            "GOOGLEDOCS".to_string(),
            entries(&[
                ("GOOGLEDOCS_CREATE_DOCUMENT", "Create a new document with a title and body"),
                ("GOOGLEDOCS_GET_DOCUMENT_BY_ID", "Fetch a document's content by id"),
                ("GOOGLEDOCS_UPDATE_EXISTING_DOCUMENT", "Append or edit content in a document"),
            ]),
        );
        apps.insert(
            "NOTION".to_string(),
            entries(&[
                ("NOTION_CREATE_NOTION_PAGE", "Create a page in a Notion workspace"),
                ("NOTION_SEARCH_NOTION_PAGE", "Search pages and databases by text"),
                ("NOTION_ADD_PAGE_CONTENT", "Append blocks to an existing page"),
            ]),
        );

        Self { apps }
    }
}

fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, description)| (name.to_string(), description.to_string()))
        .collect()
}

impl TopToolsCatalog {
    pub fn app_names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    pub fn has_app(&self, app_name: &str) -> bool {
        self.apps.contains_key(app_name)
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.apps.values().any(|tools| tools.contains_key(tool_name))
    }

    pub fn tools_for(&self, app_name: &str) -> Option<&BTreeMap<String, String>> {
        self.apps.get(app_name)
    }

    /// Render the catalog for inclusion in the routing prompt.
    pub fn prompt_block(&self) -> String {
        let mut lines = Vec::new();
        for (app, tools) in &self.apps {
            lines.push(format!("{app}:"));
            for (name, description) in tools {
                lines.push(format!("  {name}: {description}"));
            }
        }
        lines.join("\n")
    }
}
