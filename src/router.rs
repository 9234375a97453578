use std::fmt;

/// The panel currently shown in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewSelection {
    #[default]
    Analyzer,
    ImageGen,
    Chat,
}

impl ViewSelection {
    pub const ALL: [ViewSelection; 3] = [
        ViewSelection::Analyzer,
        ViewSelection::ImageGen,
        ViewSelection::Chat,
    ];

    /// Lenient parse: anything unrecognized selects the analyzer.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "imagegen" | "image_gen" | "image-gen" | "images" => ViewSelection::ImageGen,
            "chat" | "tutor" => ViewSelection::Chat,
            _ => ViewSelection::Analyzer,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ViewSelection::Analyzer => "Analyze",
            ViewSelection::ImageGen => "Illustrate",
            ViewSelection::Chat => "Tutor",
        }
    }
}

impl fmt::Display for ViewSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
