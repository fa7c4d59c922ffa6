//! Decoding of ICCCM and Motif window properties

use super::requests::Property;

pub const MWM_HINTS_DECORATIONS: u32 = 1 << 1;
pub const MWM_DECOR_ALL: u32 = 1 << 0;
pub const MWM_DECOR_TITLE: u32 = 1 << 3;

/// The leading fields of `WM_NORMAL_HINTS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHints {
    pub flags: u32,
    pub min_size: (i32, i32),
    pub max_size: (i32, i32),
}

impl SizeHints {
    /// Needs at least flags, position, size, min and max (9 words)
    pub fn parse(property: &Property) -> Option<Self> {
        let words = property.words();
        if words.len() < 9 {
            return None;
        }
        Some(Self {
            flags: words[0],
            min_size: (words[5] as i32, words[6] as i32),
            max_size: (words[7] as i32, words[8] as i32),
        })
    }
}

/// `_MOTIF_WM_HINTS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotifHints {
    pub flags: u32,
    pub functions: u32,
    pub decorations: u32,
}

impl MotifHints {
    pub fn parse(property: &Property) -> Option<Self> {
        let words = property.words();
        if words.len() < 5 {
            return None;
        }
        Some(Self {
            flags: words[0],
            functions: words[1],
            decorations: words[2],
        })
    }

    /// Title bar decision, `None` when the hints say nothing about decorations
    pub fn decorated(&self) -> Option<bool> {
        if self.flags & MWM_HINTS_DECORATIONS == 0 {
            return None;
        }
        // DECOR_ALL inverts the meaning of the other bits
        Some(if self.decorations & MWM_DECOR_ALL != 0 {
            self.decorations & MWM_DECOR_TITLE == 0
        } else {
            self.decorations & MWM_DECOR_TITLE != 0
        })
    }
}

/// Class name (second string) of `WM_CLASS`
pub fn wm_class(property: &Property) -> Option<String> {
    let value = &property.value;
    let instance_end = value.iter().position(|b| *b == 0)?;
    let class = &value[instance_end + 1..];
    let class = match class.iter().position(|b| *b == 0) {
        Some(end) => &class[..end],
        None => class,
    };
    Some(String::from_utf8_lossy(class).into_owned())
}

/// Text properties such as `WM_NAME` and `_NET_STARTUP_ID`
pub fn text(property: &Property) -> String {
    let value = match property.value.iter().position(|b| *b == 0) {
        Some(end) => &property.value[..end],
        None => &property.value[..],
    };
    String::from_utf8_lossy(value).into_owned()
}

/// A window id property such as `WM_TRANSIENT_FOR`, `None` for 0 or short values
pub fn window(property: &Property) -> Option<u32> {
    property.words().first().copied().filter(|w| *w != 0)
}
