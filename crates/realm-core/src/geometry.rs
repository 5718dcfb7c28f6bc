use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A point or direction on the arena plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(self, other: Vec2) -> f32 {
        (other - self).length()
    }

    pub fn normalize(self) -> Vec2 {
        let len = self.length();
        if len == 0.0 {
            Vec2::ZERO
        } else {
            Vec2::new(self.x / len, self.y / len)
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Step from `from` toward `to`, covering at most `max_step` units.
/// Snaps onto the target once it is within reach.
pub fn move_towards(from: Vec2, to: Vec2, max_step: f32) -> Vec2 {
    let delta = to - from;
    let remaining = delta.length();
    if remaining <= max_step || remaining == 0.0 {
        return to;
    }
    from + delta.normalize() * max_step
}

/// Axis-aligned rectangle given by its min and max corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub const fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Square box centred on `center` with the given half extent.
    pub fn around(center: Vec2, half: f32) -> Self {
        Self {
            min: Vec2::new(center.x - half, center.y - half),
            max: Vec2::new(center.x + half, center.y + half),
        }
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Strict overlap: boxes that only share an edge do not overlap.
    pub fn overlaps(&self, other: &Rect) -> bool {
        !(self.max.x <= other.min.x
            || other.max.x <= self.min.x
            || self.max.y <= other.min.y
            || other.max.y <= self.min.y)
    }

    /// Clamp `p` into the rectangle per axis. The flag reports whether any
    /// axis had to be clamped.
    pub fn clamp(&self, p: Vec2) -> (Vec2, bool) {
        let x = p.x.clamp(self.min.x, self.max.x);
        let y = p.y.clamp(self.min.y, self.max.y);
        let clamped = x != p.x || y != p.y;
        (Vec2::new(x, y), clamped)
    }

    /// Grow the rectangle by `margin` on every side.
    pub fn inflate(&self, margin: f32) -> Rect {
        Rect {
            min: Vec2::new(self.min.x - margin, self.min.y - margin),
            max: Vec2::new(self.max.x + margin, self.max.y + margin),
        }
    }
}

/// What a collider represents on the map. Only some categories take part
/// in movement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColliderCategory {
    Land,
    Island,
    Collider,
    LevelDivider,
    Decoration,
}

/// A named static box on the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collider {
    pub name: String,
    pub category: ColliderCategory,
    pub rect: Rect,
}

/// Result of testing an avatar box against the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contact {
    Free,
    /// Position is kept, but the participant is debuffed.
    Collided,
    /// Movement is halted and the participant is debuffed.
    Blocked,
    /// Movement is halted, debuffed, and a short invulnerability window applies.
    Stuck,
}

/// Immutable set of colliders loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapGeometry {
    pub name: String,
    pub colliders: Vec<Collider>,
}

impl MapGeometry {
    pub fn empty() -> Self {
        Self {
            name: "empty".to_string(),
            colliders: Vec::new(),
        }
    }

    /// Classify an avatar box. The first collider in map order that overlaps
    /// decides the outcome.
    pub fn classify(&self, avatar: &Rect, sticky_islands: bool) -> Contact {
        for collider in &self.colliders {
            if !collider.rect.overlaps(avatar) {
                continue;
            }
            return match collider.category {
                ColliderCategory::Collider | ColliderCategory::LevelDivider => Contact::Stuck,
                ColliderCategory::Land => Contact::Collided,
                ColliderCategory::Island if sticky_islands => Contact::Stuck,
                ColliderCategory::Island => Contact::Blocked,
                ColliderCategory::Decoration => continue,
            };
        }
        Contact::Free
    }

    /// Whether the box overlaps any collider at all, decorations included.
    pub fn overlaps_any(&self, area: &Rect) -> bool {
        self.colliders.iter().any(|c| c.rect.overlaps(area))
    }

    pub fn get(&self, name: &str) -> Option<&Collider> {
        self.colliders.iter().find(|c| c.name == name)
    }
}

/// Load a map from a JSON file, returning `None` if the file is missing or invalid.
pub fn load_map_from_file(path: &str) -> Option<MapGeometry> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<MapGeometry>(&content) {
            Ok(map) => {
                tracing::info!(path, colliders = map.colliders.len(), "Loaded map geometry");
                Some(map)
            },
            Err(e) => {
                tracing::warn!("Failed to parse {path}: {e}");
                None
            },
        },
        Err(_) => None,
    }
}

/// Load the map at `path`, falling back to the generated default map.
pub fn load_map(path: &str) -> MapGeometry {
    load_map_from_file(path).unwrap_or_else(|| {
        tracing::info!(path, "No map file found, using generated default map");
        generate_map()
    })
}

/// Built-in map used when no map file is configured: two land masses, a
/// central island chain, and a divider wall splitting the upper arena.
pub fn generate_map() -> MapGeometry {
    let mut colliders = vec![
        Collider {
            name: "west-shore".to_string(),
            category: ColliderCategory::Land,
            rect: Rect::new(Vec2::new(-2000.0, -2000.0), Vec2::new(-1700.0, 2000.0)),
        },
        Collider {
            name: "east-shore".to_string(),
            category: ColliderCategory::Land,
            rect: Rect::new(Vec2::new(1700.0, -2000.0), Vec2::new(2000.0, 2000.0)),
        },
        Collider {
            name: "north-divider".to_string(),
            category: ColliderCategory::LevelDivider,
            rect: Rect::new(Vec2::new(-20.0, 900.0), Vec2::new(20.0, 1600.0)),
        },
    ];

    for (i, x) in [-600.0f32, 0.0, 600.0].into_iter().enumerate() {
        colliders.push(Collider {
            name: format!("island-{i}"),
            category: ColliderCategory::Island,
            rect: Rect::around(Vec2::new(x, 0.0), 80.0),
        });
    }

    for (i, (x, y)) in [(-1200.0f32, -1200.0f32), (1200.0, -1200.0)]
        .into_iter()
        .enumerate()
    {
        colliders.push(Collider {
            name: format!("rock-{i}"),
            category: ColliderCategory::Collider,
            rect: Rect::around(Vec2::new(x, y), 60.0),
        });
    }

    MapGeometry {
        name: "default".to_string(),
        colliders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(name: &str, category: ColliderCategory, center: Vec2, half: f32) -> Collider {
        Collider {
            name: name.to_string(),
            category,
            rect: Rect::around(center, half),
        }
    }

    #[test]
    fn move_towards_snaps_when_in_reach() {
        let p = move_towards(Vec2::new(0.0, 0.0), Vec2::new(3.0, 4.0), 5.0);
        assert_eq!(p, Vec2::new(3.0, 4.0));
    }

    #[test]
    fn move_towards_caps_step() {
        let p = move_towards(Vec2::new(0.0, 0.0), Vec2::new(30.0, 40.0), 5.0);
        assert!((p.x - 3.0).abs() < 1e-4);
        assert!((p.y - 4.0).abs() < 1e-4);
    }

    #[test]
    fn move_towards_zero_step_stays() {
        let p = move_towards(Vec2::new(1.0, 1.0), Vec2::new(10.0, 1.0), 0.0);
        assert_eq!(p, Vec2::new(1.0, 1.0));
    }

    #[test]
    fn clamp_reports_out_of_bounds() {
        let bounds = Rect::new(Vec2::new(-10.0, -10.0), Vec2::new(10.0, 10.0));
        let (p, oob) = bounds.clamp(Vec2::new(110.0, 5.0));
        assert!(oob);
        assert_eq!(p, Vec2::new(10.0, 5.0));

        let (p, oob) = bounds.clamp(Vec2::new(3.0, -2.0));
        assert!(!oob);
        assert_eq!(p, Vec2::new(3.0, -2.0));
    }

    #[test]
    fn edge_touch_is_not_overlap() {
        let a = Rect::new(Vec2::new(0.0, 0.0), Vec2::new(1.0, 1.0));
        let b = Rect::new(Vec2::new(1.0, 0.0), Vec2::new(2.0, 1.0));
        assert!(!a.overlaps(&b));
        let c = Rect::new(Vec2::new(0.5, 0.5), Vec2::new(2.0, 2.0));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn classify_by_category() {
        let map = MapGeometry {
            name: "t".to_string(),
            colliders: vec![
                square("land", ColliderCategory::Land, Vec2::new(0.0, 0.0), 5.0),
                square("island", ColliderCategory::Island, Vec2::new(50.0, 0.0), 5.0),
                square("wall", ColliderCategory::Collider, Vec2::new(100.0, 0.0), 5.0),
                square("div", ColliderCategory::LevelDivider, Vec2::new(150.0, 0.0), 5.0),
                square("deco", ColliderCategory::Decoration, Vec2::new(200.0, 0.0), 5.0),
            ],
        };
        let at = |x: f32| Rect::around(Vec2::new(x, 0.0), 1.0);
        assert_eq!(map.classify(&at(0.0), false), Contact::Collided);
        assert_eq!(map.classify(&at(50.0), false), Contact::Blocked);
        assert_eq!(map.classify(&at(50.0), true), Contact::Stuck);
        assert_eq!(map.classify(&at(100.0), false), Contact::Stuck);
        assert_eq!(map.classify(&at(150.0), false), Contact::Stuck);
        assert_eq!(map.classify(&at(200.0), false), Contact::Free);
        assert_eq!(map.classify(&at(-300.0), false), Contact::Free);
    }

    #[test]
    fn classify_first_collider_in_map_order_wins() {
        let map = MapGeometry {
            name: "t".to_string(),
            colliders: vec![
                square("land", ColliderCategory::Land, Vec2::new(0.0, 0.0), 5.0),
                square("wall", ColliderCategory::Collider, Vec2::new(0.0, 0.0), 5.0),
            ],
        };
        assert_eq!(
            map.classify(&Rect::around(Vec2::ZERO, 1.0), false),
            Contact::Collided
        );
    }

    #[test]
    fn generated_map_roundtrips_through_json() {
        let map = generate_map();
        let json = serde_json::to_string(&map).unwrap();
        let back: MapGeometry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.colliders.len(), map.colliders.len());
        assert!(back.get("island-1").is_some());
    }

    #[test]
    fn missing_map_file_falls_back() {
        let map = load_map("/nonexistent/realm-map.json");
        assert_eq!(map.name, "default");
    }
}
