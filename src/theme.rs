use crate::config::Config;
use adocview::html::DocumentShell;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use syntect::highlighting::{Color, Theme, ThemeSet};

pub struct ThemeManager {
    theme_set: ThemeSet,
    theme_names: Vec<String>,
}

/// Page colours pulled from a syntect theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePalette {
    pub base_fg: Color,
    pub base_bg: Option<Color>,
    pub accent: Color,
    pub muted: Color,
    pub code_bg: Option<Color>,
}

impl ThemeManager {
    pub fn load(config: &Config) -> Result<Self> {
        let mut theme_set = ThemeSet::load_defaults();

        if let Some(dir) = &config.theme_dir {
            if dir.exists() {
                let extra = ThemeSet::load_from_folder(dir)
                    .with_context(|| format!("Failed to load themes from {}", dir.display()))?;
                theme_set.themes.extend(extra.themes);
            }
        }

        let mut theme_names: Vec<String> = theme_set.themes.keys().cloned().collect();
        theme_names.sort();

        Ok(Self {
            theme_set,
            theme_names,
        })
    }

    pub fn theme_names(&self) -> &[String] {
        &self.theme_names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.theme_set.themes.contains_key(name)
    }

    /// Unknown names resolve to the fallback theme.
    pub fn get(&self, name: &str) -> Theme {
        match self.theme_set.themes.get(name) {
            Some(theme) => theme.clone(),
            None => self
                .theme_set
                .themes
                .get(self.fallback_name())
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn fallback_name(&self) -> &str {
        if self.contains("base16-ocean.dark") {
            return "base16-ocean.dark";
        }
        self.theme_names
            .first()
            .map(|s| s.as_str())
            .unwrap_or("base16-ocean.dark")
    }

    pub fn palette(&self, name: &str) -> PagePalette {
        palette_from_theme(&self.get(name))
    }

    /// Page scaffold coloured after `name`.
    pub fn shell(&self, name: &str, default_title: &str) -> DocumentShell {
        DocumentShell::new(default_title, stylesheet(&self.palette(name)))
    }
}

fn palette_from_theme(theme: &Theme) -> PagePalette {
    let settings = &theme.settings;
    let base_fg = settings.foreground.unwrap_or(Color {
        r: 0x33,
        g: 0x33,
        b: 0x33,
        a: 0xff,
    });
    let accent = settings
        .selection_foreground
        .or(settings.caret)
        .or(settings.foreground)
        .unwrap_or(base_fg);
    let muted = settings
        .gutter_foreground
        .or(settings.foreground)
        .unwrap_or(base_fg);
    let code_bg = settings
        .line_highlight
        .or(settings.selection)
        .or(settings.background);

    PagePalette {
        base_fg,
        base_bg: settings.background,
        accent,
        muted,
        code_bg,
    }
}

pub fn stylesheet(palette: &PagePalette) -> String {
    let mut css = String::new();
    let _ = write!(css, "body {{ color: {};", css_color(palette.base_fg));
    if let Some(bg) = palette.base_bg {
        let _ = write!(css, " background: {};", css_color(bg));
    }
    css.push_str(" }\n");
    let _ = writeln!(
        css,
        "h1, h2, h3, h4, h5, h6, a {{ color: {}; }}",
        css_color(palette.accent)
    );
    let _ = writeln!(
        css,
        "blockquote, .adoc-fallback {{ color: {}; }}",
        css_color(palette.muted)
    );
    if let Some(bg) = palette.code_bg {
        let _ = writeln!(css, "code, .listingblock pre {{ background: {}; }}", css_color(bg));
    }
    css
}

fn css_color(color: Color) -> String {
    format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
}

#[cfg(test)]
mod tests {
    use super::{PagePalette, ThemeManager, css_color, stylesheet};
    use crate::config::Config;
    use syntect::highlighting::Color;

    fn manager() -> ThemeManager {
        let config = Config {
            theme_dir: None,
            ..Config::default()
        };
        ThemeManager::load(&config).unwrap()
    }

    #[test]
    fn defaults_are_listed_sorted() {
        let themes = manager();
        let names = themes.theme_names();
        assert!(names.iter().any(|n| n == "InspiredGitHub"));
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn unknown_theme_falls_back() {
        let themes = manager();
        assert!(!themes.contains("no-such-theme"));
        assert_eq!(themes.palette("no-such-theme"), themes.palette("base16-ocean.dark"));
    }

    #[test]
    fn stylesheet_uses_hex_colours() {
        let black = Color { r: 0, g: 0, b: 0, a: 0xff };
        let white = Color { r: 0xff, g: 0xff, b: 0xff, a: 0xff };
        let css = stylesheet(&PagePalette {
            base_fg: black,
            base_bg: Some(white),
            accent: black,
            muted: black,
            code_bg: None,
        });
        assert!(css.contains("color: #000000; background: #ffffff;"));
        assert!(!css.contains("code,"));
        assert_eq!(css_color(Color { r: 0x12, g: 0xab, b: 0x05, a: 0 }), "#12ab05");
    }

    #[test]
    fn different_themes_give_different_shells() {
        let themes = manager();
        let dark = themes.shell("base16-ocean.dark", "doc");
        let light = themes.shell("InspiredGitHub", "doc");
        assert_ne!(dark.stylesheet, light.stylesheet);
        assert_eq!(dark.default_title, "doc");
    }
}
