use std::fmt;
use std::str::FromStr;

/// How much detail the caption should carry. Mirrors the node's `mode` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailLevel {
    #[default]
    Simple,
    Detailed,
}

impl DetailLevel {
    pub const ALL: [DetailLevel; 2] = [DetailLevel::Simple, DetailLevel::Detailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Simple => "simple",
            DetailLevel::Detailed => "detailed",
        }
    }

    /// Prompt sent alongside the image.
    ///
    /// Both variants ask for a JSON object keyed by `中文提示词` / `英文提示词`,
    /// which is what the caption parser tries first.
    pub fn prompt(&self) -> &'static str {
        match self {
            DetailLevel::Simple => {
                "这是一张图片的描述，将用于AI大模型制作文生图或图生图。\
                 请简洁明了地用中文描述这张图片，符合提示词习惯，然后用英文翻译同样的内容。\
                 请给出json格式回答，具体内容是{\"中文提示词\":\"\",\"英文提示词\":\"\"}。"
            }
            DetailLevel::Detailed => {
                "请给我一段提示词，可以准确向其他文生图大模型描述这张图片，以生成相似的图片。\
                 描述内容尽可能详细，包括但不限于主体(含权重)、位置关系、细节、风格等，\
                 返回文本需要包含中英文，给出json格式回答，\
                 具体内容是{\"中文提示词\":\"\",\"英文提示词\":\"\"}。"
            }
        }
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetailLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(DetailLevel::Simple),
            "detailed" => Ok(DetailLevel::Detailed),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings() {
        for level in DetailLevel::ALL {
            assert_eq!(level.as_str().parse::<DetailLevel>().unwrap(), level);
        }
        assert_eq!(" Detailed ".parse::<DetailLevel>().unwrap(), DetailLevel::Detailed);
        assert!("verbose".parse::<DetailLevel>().is_err());
    }

    #[test]
    fn test_prompts_request_json_keys() {
        for level in DetailLevel::ALL {
            assert!(level.prompt().contains("中文提示词"));
            assert!(level.prompt().contains("英文提示词"));
        }
        assert_ne!(DetailLevel::Simple.prompt(), DetailLevel::Detailed.prompt());
    }
}
