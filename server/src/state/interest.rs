//! Per-(client, entity) interest decisions: whether an entity should exist
//! on a client, how often it syncs, and how soon unacked records reissue.

use std::sync::OnceLock;

use glam::{Mat4, Vec3, Vec4};

use crate::world::entity::EntityType;

/// 2D cull boundary; strictly-less-than keeps the exact distance culled.
pub const CULL_RANGE_SQ: f32 = 350.0 * 350.0;

/// Reassignment candidates beyond this are ignored.
pub const REASSIGN_RANGE_SQ: f32 = 300.0 * 300.0;

struct ViewClips {
    near: Vec4,
    far: Vec4,
    top: Vec4,
    bottom: Vec4,
    left: Vec4,
    right: Vec4,
}

impl ViewClips {
    fn new(matrix: &Mat4) -> Self {
        let tp = matrix.transpose();

        Self {
            left: tp * Vec4::new(1.0, 0.0, 0.0, 1.0),
            right: tp * Vec4::new(-1.0, 0.0, 0.0, 1.0),
            bottom: tp * Vec4::new(0.0, 1.0, 0.0, 1.0),
            top: tp * Vec4::new(0.0, -1.0, 0.0, 1.0),
            near: tp * Vec4::new(0.0, 0.0, 1.0, 1.0),
            far: tp * Vec4::new(0.0, 0.0, -1.0, 1.0),
        }
    }
}

fn projection_clips() -> &'static ViewClips {
    static CLIPS: OnceLock<ViewClips> = OnceLock::new();

    CLIPS.get_or_init(|| {
        let projection =
            Mat4::perspective_rh_gl(90.0f32.to_radians(), 4.0 / 3.0, 0.1, 1000.0);
        ViewClips::new(&projection)
    })
}

/// Sphere-vs-frustum test in the client's view space.
pub fn is_in_frustum(pos: Vec3, radius: f32, view_matrix: &Mat4) -> bool {
    let view_coords = *view_matrix * pos.extend(1.0);

    let test_plane = |plane: &Vec4| {
        view_coords.x * plane.x + view_coords.y * plane.y + view_coords.z * plane.z
            + plane.w
            + radius
            >= 0.0
    };

    let clips = projection_clips();

    test_plane(&clips.near)
        && test_plane(&clips.bottom)
        && test_plane(&clips.top)
        && test_plane(&clips.left)
        && test_plane(&clips.right)
        && test_plane(&clips.far)
}

/// Average radius per type until model info is tracked somewhere.
pub fn object_radius(entity_type: EntityType) -> f32 {
    match entity_type {
        EntityType::Ped | EntityType::Player => 2.5,
        EntityType::Heli | EntityType::Boat | EntityType::Plane => 15.0,
        _ => 5.0,
    }
}

/// Does this client currently need to know about this entity?
pub fn should_be_created(
    culling: bool,
    owned: bool,
    entity_type: EntityType,
    entity_pos: Vec3,
    player_pos: Option<Vec3>,
    vehicle_occupied: bool,
) -> bool {
    if !culling {
        return true;
    }

    // clients always keep their own entities
    if owned {
        return true;
    }

    match player_pos {
        Some(focus) => {
            let diff_x = entity_pos.x - focus.x;
            let diff_y = entity_pos.y - focus.y;

            if diff_x * diff_x + diff_y * diff_y < CULL_RANGE_SQ {
                return true;
            }
        }
        // can't really cull without a reference position
        None => return true,
    }

    if entity_type == EntityType::Player {
        return true;
    }

    if entity_type.is_vehicle() && vehicle_occupied {
        return true;
    }

    false
}

/// Sync cadence in milliseconds for an entity the client already knows.
pub fn sync_delay_ms(
    radius_frequency: bool,
    entity_type: EntityType,
    entity_pos: Vec3,
    player_pos: Option<Vec3>,
    view_matrix: &Mat4,
) -> u64 {
    if !radius_frequency {
        return 50;
    }

    let mut delay = 50;

    if !is_in_frustum(entity_pos, object_radius(entity_type), view_matrix) {
        delay = 150;
    }

    if let Some(focus) = player_pos {
        let dist = entity_pos.distance_squared(focus);

        if dist > 500.0 * 500.0 {
            delay = 500;
        } else if dist > 250.0 * 250.0 {
            delay = 250;
        }
    }

    delay
}

/// Backoff before an unacked record is written again.
pub fn resend_delay_ms(ping_ms: u32, ping_variance_ms: u32) -> u64 {
    (ping_ms as i64 * 3 - ping_variance_ms as i64).max(1) as u64
}
