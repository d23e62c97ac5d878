use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Screen point in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

impl From<[i32; 2]> for Point {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [i32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Rectangle inside a frame. A zero-area rect stands for "the whole frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, w: width, h: height }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Right edge, clamped at `u32::MAX`.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    /// Whether both edges are representable without clamping.
    pub fn is_addressable(&self) -> bool {
        self.x.checked_add(self.w).is_some() && self.y.checked_add(self.h).is_some()
    }

    pub fn center(&self) -> Point {
        Point::new(self.x.saturating_add(self.w / 2) as i32, self.y.saturating_add(self.h / 2) as i32)
    }

    /// Whether the rect lies entirely inside a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        !self.is_empty() && self.right() <= width && self.bottom() <= height
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        (r > x && b > y).then(|| Rect::new(x, y, r - x, b - y))
    }
}

impl From<[u32; 4]> for Rect {
    fn from([x, y, w, h]: [u32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Rect> for [u32; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.w, r.h]
    }
}

/// One captured screen sample. Pixels are shared, so clones are cheap; the
/// image itself is never mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<GrayImage>,
    captured_at: Instant,
    seq: u64,
}

impl Frame {
    pub fn new(image: GrayImage, seq: u64) -> Self {
        Self { image: Arc::new(image), captured_at: Instant::now(), seq }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn bounds(&self) -> Rect {
        Rect::full(self.width(), self.height())
    }
}

/// Logical situation the monitored application is in.
///
/// The named variants are the states the stock profiles use; any other id
/// coming from a profile is kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GameState {
    MainScreen,
    ShopInterior,
    BookOverlay,
    ClientMenu,
    ItemListOverlay,
    VisitingOtherFarm,
    TutorialOverlay,
    #[default]
    Unknown,
    Other(String),
}

impl GameState {
    pub fn id(&self) -> &str {
        match self {
            GameState::MainScreen => "main_screen",
            GameState::ShopInterior => "shop_interior",
            GameState::BookOverlay => "book_overlay",
            GameState::ClientMenu => "client_menu",
            GameState::ItemListOverlay => "item_list_overlay",
            GameState::VisitingOtherFarm => "visiting_other_farm",
            GameState::TutorialOverlay => "tutorial_overlay",
            GameState::Unknown => "unknown",
            GameState::Other(id) => id,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, GameState::Unknown)
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for GameState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        if id.is_empty() {
            return Err("state id cannot be empty".into());
        }
        Ok(match id {
            "main_screen" => GameState::MainScreen,
            "shop_interior" => GameState::ShopInterior,
            "book_overlay" => GameState::BookOverlay,
            "client_menu" => GameState::ClientMenu,
            "item_list_overlay" => GameState::ItemListOverlay,
            "visiting_other_farm" => GameState::VisitingOtherFarm,
            "tutorial_overlay" => GameState::TutorialOverlay,
            "unknown" => GameState::Unknown,
            other => GameState::Other(other.to_string()),
        })
    }
}

impl TryFrom<String> for GameState {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GameState> for String {
    fn from(s: GameState) -> Self {
        s.id().to_string()
    }
}

/// Payload delivered to state subscribers on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: GameState,
    pub to: GameState,
    pub at: Instant,
}

/// Occupancy of one slot as seen by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Empty,
    Occupied,
    Sold,
}

/// Classification result for one slot. Recomputed on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    /// 1-based position in the layout.
    pub index: usize,
    pub region: Rect,
    pub tap: Point,
    pub status: SlotStatus,
}

/// Outcome of one scan pass over every slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Slots available for filling, ascending. Includes collected sold slots.
    pub empty: Vec<usize>,
    pub occupied: usize,
    pub sold: usize,
    pub slots: Vec<Slot>,
}

impl ScanReport {
    pub fn summary(&self) -> String {
        format!(
            "{} empty {:?}, {} occupied, {} sold",
            self.empty.len(),
            self.empty,
            self.occupied,
            self.sold
        )
    }
}

/// Health of the capture producer, observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineHealth {
    Idle,
    Running,
    Degraded,
    Stopped,
}

/// Device link state published by the connectivity observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}
