//! Minimal inline HTML for the platform pages.
//!
//! The deployed frontend is a separate concern; these pages only need to
//! carry the login form, the home view and enough data for the container
//! creation form.

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Login form, optionally with an error banner.
pub fn login_page(error: Option<&str>) -> String {
    let banner = match error {
        Some(msg) => format!("<p class=\"error\">{}</p>\n", escape(msg)),
        None => String::new(),
    };
    let body = format!(
        "<h1>Workspace Login</h1>\n{banner}\
         <form method=\"post\" action=\"/auth/login\">\n\
         <label>Username <input type=\"text\" name=\"username\" autocomplete=\"username\"></label>\n\
         <label>Password <input type=\"password\" name=\"password\" autocomplete=\"current-password\"></label>\n\
         <button type=\"submit\">Sign in</button>\n\
         </form>"
    );
    page("Workspace Login", &body)
}

/// Home page with the user's workspace placement, if any.
pub fn home_page(username: &str, container: Option<(&str, &str, &str)>) -> String {
    let workspace = match container {
        Some((name, agent, created)) => format!(
            "<p>Workspace <code>{}</code> on <code>{}</code> (created {})</p>\n\
             <form method=\"post\" action=\"/csplatform/containers/start\"><button>Start</button></form>\n\
             <form method=\"post\" action=\"/csplatform/containers/stop\"><button>Stop</button></form>\n\
             <form method=\"post\" action=\"/csplatform/containers/restart\"><button>Restart</button></form>\n\
             <form method=\"post\" action=\"/csplatform/containers/delete\"><button>Delete</button></form>\n\
             <p><a href=\"/code-server/\">Open workspace</a></p>",
            escape(name),
            escape(agent),
            escape(created)
        ),
        None => "<p>No workspace yet.</p>\n\
                 <p><a href=\"/csplatform/containers/create\">Create one</a></p>"
            .to_string(),
    };
    let body = format!(
        "<h1>Workspaces</h1>\n<p>Signed in as <strong>{}</strong></p>\n{workspace}\n\
         <form method=\"post\" action=\"/auth/logout\"><button>Log out</button></form>",
        escape(username)
    );
    page("Workspaces", &body)
}

/// Container creation form carrying agent options and template defaults.
pub fn container_create_page(
    username: &str,
    agent_options: &[String],
    defaults_json: &str,
) -> String {
    let options: String = agent_options
        .iter()
        .map(|a| format!("<option value=\"{0}\">{0}</option>\n", escape(a)))
        .collect();
    let body = format!(
        "<h1>Create Workspace</h1>\n\
         <form method=\"post\" action=\"/api/v1/containers/create\">\n\
         <label>Agent <select name=\"agent\">{options}</select></label>\n\
         <label>Name <input type=\"text\" name=\"name\" value=\"code-server-{}\"></label>\n\
         <button type=\"submit\">Create</button>\n\
         </form>\n\
         <script id=\"defaults\" type=\"application/json\">{defaults_json}</script>",
        escape(username)
    );
    page("Create Workspace", &body)
}

/// Custom 404 page.
pub fn not_found_page() -> String {
    page("Not Found", "<h1>404</h1>\n<p>The page does not exist.</p>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_page_escapes_error() {
        let html = login_page(Some("<script>alert(1)</script>"));
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("name=\"username\""));
    }

    #[test]
    fn home_page_without_container_offers_create() {
        let html = home_page("alice", None);
        assert!(html.contains("alice"));
        assert!(html.contains("/csplatform/containers/create"));
    }

    #[test]
    fn home_page_with_container_lists_actions() {
        let html = home_page("alice", Some(("code-server-alice", "agent-1", "2026-07-01")));
        assert!(html.contains("code-server-alice"));
        assert!(html.contains("/csplatform/containers/stop"));
        assert!(html.contains("/code-server/"));
    }
}
