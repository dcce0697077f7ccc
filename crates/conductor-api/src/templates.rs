//! Example workflows printed by `cndr example`.

use conductor_types::workflow::{RetryConfig, Step, Workflow};

/// Search for a term: open, navigate, type, submit, capture.
pub fn search() -> Workflow {
    Workflow::new("Search Example")
        .with_description("Perform a web search")
        .with_variable("search_term", "computer vision")
        .with_step(
            Step::new("step1", "open_browser")
                .with_param("browser", "chrome")
                .with_description("Open Chrome browser")
                .with_timeout(30)
                .with_retry(RetryConfig::default()),
        )
        .with_step(
            Step::new("step2", "navigate_to")
                .with_param("url", "https://www.google.com")
                .with_description("Navigate to the search page")
                .with_timeout(30),
        )
        .with_step(
            Step::new("step3", "type_text")
                .with_param("text", "${search_term}")
                .with_description("Type search term")
                .with_timeout(10),
        )
        .with_step(
            Step::new("step4", "press_key")
                .with_param("key", "enter")
                .with_description("Press Enter to search")
                .with_timeout(10),
        )
        .with_step(
            Step::new("step5", "take_screenshot")
                .with_param("filename", "search_results.png")
                .with_description("Take screenshot of search results")
                .with_timeout(10),
        )
}

/// Open a browser on `url` and capture it.
pub fn browser(url: &str) -> Workflow {
    Workflow::new("Browser Example")
        .with_description(format!("Browser workflow to navigate to {url}"))
        .with_step(
            Step::new("open_browser", "open_browser")
                .with_param("browser", "chrome")
                .with_description("Open Chrome browser"),
        )
        .with_step(
            Step::new("navigate", "navigate_to")
                .with_param("url", url)
                .with_description(format!("Navigate to {url}")),
        )
        .with_step(
            Step::new("screenshot", "take_screenshot")
                .with_param("filename", "browser_screenshot.png")
                .with_description("Take screenshot of the page"),
        )
}

/// Navigate to `url`, then pull its text and UI elements.
pub fn extraction(url: &str) -> Workflow {
    Workflow::new("Extraction Example")
        .with_description(format!("Data extraction workflow for {url}"))
        .with_step(
            Step::new("open_browser", "open_browser")
                .with_param("browser", "chrome")
                .with_description("Open Chrome browser"),
        )
        .with_step(
            Step::new("navigate", "navigate_to")
                .with_param("url", url)
                .with_description(format!("Navigate to {url}")),
        )
        .with_step(Step::new("extract_text", "extract_text").with_description("Extract all text from the page"))
        .with_step(Step::new("detect_ui", "detect_ui").with_description("Detect UI elements on the page"))
        .with_step(
            Step::new("screenshot", "take_screenshot")
                .with_param("filename", "extraction_screenshot.png")
                .with_description("Take screenshot of the page"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::action::ActionRegistry;

    use crate::demo;

    #[test]
    fn templates_are_valid_and_runnable() {
        let registry: ActionRegistry = demo::registry(Default::default());
        for wf in [search(), browser("https://example.com"), extraction("https://example.com")] {
            wf.validate().unwrap();
            for step in &wf.steps {
                registry.resolve(&step.action).unwrap();
            }
        }
    }

    #[test]
    fn url_lands_in_navigation_step() {
        let wf = browser("https://rust-lang.org");
        assert_eq!(wf.step("navigate").unwrap().params["url"], "https://rust-lang.org");
    }
}
